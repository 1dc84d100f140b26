use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::project::{read_json, ProjectError};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 41749;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_startup_timeout_ms() -> u64 {
    15_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Which host adapter the dispatcher talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostAdapterConfig {
    /// In-process stub host that stores projects as JSON documents.
    #[default]
    Local,
    /// External executable invoked once per operation.
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

/// Bridge settings stored as `config.json` in the state directory.
/// Every field is optional on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-call timeout applied when a request carries no `timeoutMs`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Append one JSONL line per dispatched call under `rpc-logs/`.
    #[serde(default = "default_true")]
    pub audit: bool,
    pub host_adapter: HostAdapterConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            default_timeout_ms: default_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            log_filter: default_log_filter(),
            audit: true,
            host_adapter: HostAdapterConfig::default(),
        }
    }
}

impl BridgeSettings {
    /// Apply `HARNESS_*` environment overrides on top of the loaded file.
    pub fn apply_env(&mut self) -> Result<(), AppError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), AppError> {
        if let Some(host) = get("HARNESS_BRIDGE_HOST").filter(|v| !v.is_empty()) {
            self.host = host;
        }
        if let Some(port) = get("HARNESS_BRIDGE_PORT").filter(|v| !v.is_empty()) {
            self.port = port.parse().map_err(|_| {
                AppError::invalid_input(format!("HARNESS_BRIDGE_PORT is not a port number: {port}"))
            })?;
        }
        if let Some(program) = get("HARNESS_HOST_BIN").filter(|v| !v.is_empty()) {
            self.host_adapter = HostAdapterConfig::Command {
                program: PathBuf::from(program),
                args: Vec::new(),
                timeout_ms: self.default_timeout_ms,
            };
        }
        Ok(())
    }

    /// Socket address to bind or dial. Only loopback addresses are accepted.
    pub fn socket_addr(&self) -> Result<SocketAddr, AppError> {
        let ip: IpAddr = if self.host.eq_ignore_ascii_case("localhost") {
            IpAddr::from([127, 0, 0, 1])
        } else {
            self.host
                .parse()
                .map_err(|_| AppError::invalid_input(format!("invalid bridge host: {}", self.host)))?
        };
        if !ip.is_loopback() {
            return Err(AppError::invalid_input(format!(
                "bridge host must be a loopback address, got {}",
                self.host
            )));
        }
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Load settings from `<state_dir>/config.json`, falling back to defaults
/// when the file is absent, then apply environment overrides.
pub fn load_settings(state_dir: &Path) -> Result<BridgeSettings, AppError> {
    let path = crate::paths::config_path(state_dir);
    let mut settings = match read_json::<BridgeSettings>(&path) {
        Ok(s) => s,
        Err(ProjectError::Missing(_)) => BridgeSettings::default(),
        Err(e) => {
            return Err(AppError::invalid_input(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };
    settings.apply_env()?;
    settings.socket_addr()?;
    Ok(settings)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::setup_test_dir;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let s = BridgeSettings::default();
        assert_eq!(s.port, 41749);
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.host_adapter, HostAdapterConfig::Local);
        assert_eq!(s.base_url(), "http://127.0.0.1:41749");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = setup_test_dir("settings");
        std::fs::write(
            crate::paths::config_path(&dir),
            r#"{"port": 5000, "host_adapter": {"kind": "command", "program": "/usr/bin/host"}}"#,
        )
        .unwrap();
        let s: BridgeSettings = read_json(&crate::paths::config_path(&dir)).unwrap();
        assert_eq!(s.port, 5000);
        assert_eq!(s.default_timeout_ms, 30_000);
        assert!(s.audit);
        assert!(matches!(s.host_adapter, HostAdapterConfig::Command { ref args, .. } if args.is_empty()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_non_loopback_host_rejected() {
        let s = BridgeSettings {
            host: "0.0.0.0".into(),
            ..BridgeSettings::default()
        };
        let err = s.socket_addr().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidInput);

        let local = BridgeSettings {
            host: "localhost".into(),
            ..BridgeSettings::default()
        };
        assert!(local.socket_addr().unwrap().ip().is_loopback());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HARNESS_BRIDGE_PORT", "41800"),
            ("HARNESS_HOST_BIN", "/opt/host/run"),
        ]
        .into_iter()
        .collect();
        let mut s = BridgeSettings::default();
        s.apply_overrides(|k| env.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(s.port, 41800);
        assert!(matches!(s.host_adapter, HostAdapterConfig::Command { .. }));

        let mut bad = BridgeSettings::default();
        let err = bad
            .apply_overrides(|k| (k == "HARNESS_BRIDGE_PORT").then(|| "nope".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidInput);
    }
}
