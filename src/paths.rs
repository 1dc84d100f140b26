//! Centralized path definitions for bridge state and per-project history.
//!
//! This module is the single source of truth for leaf filenames and directory
//! names. No other module should hard-code these strings.

use std::path::{Path, PathBuf};

// ── Application identity ─────────────────────────────────────────

pub const APP_ID: &str = "harness-bridge";

// ── Leaf filenames ───────────────────────────────────────────────

pub const CONFIG_FILE: &str = "config.json";
pub const LIFECYCLE_FILE: &str = "bridge.json";
pub const BRIDGE_LOG_FILE: &str = "bridge.log";
pub const HISTORY_INDEX_FILE: &str = "index.json";
pub const PAYLOAD_EXTENSION: &str = "snap";

// ── Directory names ──────────────────────────────────────────────

pub const RPC_LOGS_DIR: &str = "rpc-logs";
pub const PROJECT_META_DIR: &str = ".harness";
pub const HISTORY_DIR: &str = "history";
pub const PAYLOADS_DIR: &str = "payloads";

// ── State-dir functions (take state_dir) ─────────────────────────

/// Default state directory: `$HARNESS_BRIDGE_STATE_DIR`, else the platform
/// state/data location joined with [`APP_ID`].
pub fn default_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("HARNESS_BRIDGE_STATE_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join(APP_ID);
    }
    if cfg!(target_os = "windows") {
        if let Some(dir) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(dir).join(APP_ID);
        }
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("state").join(APP_ID),
        None => std::env::temp_dir().join(APP_ID),
    }
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE)
}

pub fn lifecycle_record_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LIFECYCLE_FILE)
}

pub fn rpc_logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(RPC_LOGS_DIR)
}

/// Stderr of a bridge started in the background.
pub fn bridge_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(BRIDGE_LOG_FILE)
}

// ── Project-relative functions (take a canonical project path) ───

/// History store for one project: `<dir>/.harness/history/<file name>/`.
pub fn history_dir(project: &Path) -> PathBuf {
    let parent = project.parent().unwrap_or_else(|| Path::new("."));
    let name = project
        .file_name()
        .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned());
    parent.join(PROJECT_META_DIR).join(HISTORY_DIR).join(name)
}

pub fn history_index_path(project: &Path) -> PathBuf {
    history_dir(project).join(HISTORY_INDEX_FILE)
}

pub fn payloads_dir(project: &Path) -> PathBuf {
    history_dir(project).join(PAYLOADS_DIR)
}

pub fn payload_path(project: &Path, digest: &str) -> PathBuf {
    payloads_dir(project).join(format!("{digest}.{PAYLOAD_EXTENSION}"))
}
