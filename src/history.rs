//! Durable per-project snapshot history with a single "current" pointer.
//!
//! Each project keeps an index file plus content-addressed payload copies
//! beside the project file (see [`crate::paths::history_dir`]). Payloads are
//! written once and never rewritten; the index is replaced atomically.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::paths;
use crate::project::{
    atomic_write, canonical_project_path, read_json, read_project_bytes, write_json, ProjectError,
};

const INDEX_VERSION: u32 = 1;

/// Durable copy of the project file a snapshot points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadRef {
    /// SHA-256 of the payload bytes, hex encoded.
    pub digest: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub project_path: PathBuf,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub payload: PayloadRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryIndex {
    version: u32,
    project: PathBuf,
    current: Option<usize>,
    snapshots: Vec<Snapshot>,
}

impl HistoryIndex {
    fn empty(project: &Path) -> Self {
        Self {
            version: INDEX_VERSION,
            project: project.to_path_buf(),
            current: None,
            snapshots: Vec::new(),
        }
    }

    /// Clamp a pointer that no longer fits the list (hand-edited index).
    fn normalize(&mut self) {
        self.current = match (self.current, self.snapshots.len()) {
            (_, 0) => None,
            (Some(i), len) if i >= len => Some(len - 1),
            (None, len) => Some(len - 1),
            (current, _) => current,
        };
    }
}

/// History listing for `project.history` and `project.status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub project_path: PathBuf,
    pub current_id: Option<String>,
    pub current_index: Option<usize>,
    pub can_undo: bool,
    pub can_redo: bool,
    pub snapshots: Vec<Snapshot>,
}

/// Manages snapshot history for every project the bridge touches.
///
/// State lives on disk only, so a restarted process sees the same history.
/// An in-process mutex per project guards each read-modify-write of the index.
#[derive(Default)]
pub struct SnapshotManager {
    guards: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

fn new_snapshot_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(12).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self, project: &Path) -> Arc<Mutex<()>> {
        self.guards
            .lock()
            .entry(project.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load_index(project: &Path) -> Result<HistoryIndex, AppError> {
        match read_json::<HistoryIndex>(&paths::history_index_path(project)) {
            Ok(mut index) => {
                index.normalize();
                Ok(index)
            }
            Err(ProjectError::Missing(_)) => Ok(HistoryIndex::empty(project)),
            Err(e) => Err(AppError::generic(format!(
                "history index for {} is unreadable: {e}",
                project.display()
            ))),
        }
    }

    fn save_index(project: &Path, index: &HistoryIndex) -> Result<(), AppError> {
        write_json(&paths::history_index_path(project), index).map_err(|e| {
            AppError::generic(format!("failed to write history index: {e}"))
        })
    }

    /// Copy the project's current bytes into the store and push a new
    /// snapshot, discarding any redo entries beyond the current pointer.
    pub fn create(&self, project: &Path, description: &str) -> Result<Snapshot, AppError> {
        let project = canonical_project_path(project)?;
        let guard = self.guard(&project);
        let _lock = guard.lock();

        let bytes = read_project_bytes(&project)?;
        let digest = sha256_hex(&bytes);
        let payload_path = paths::payload_path(&project, &digest);
        if !payload_path.exists() {
            atomic_write(&payload_path, &bytes)?;
        }

        let mut index = Self::load_index(&project)?;
        if let Some(current) = index.current {
            let discarded = index.snapshots.len().saturating_sub(current + 1);
            if discarded > 0 {
                tracing::debug!(project = %project.display(), discarded, "truncating redo branch");
            }
            index.snapshots.truncate(current + 1);
        }

        let snapshot = Snapshot {
            id: new_snapshot_id(),
            project_path: project.clone(),
            description: description.to_string(),
            created_at: Utc::now(),
            payload: PayloadRef {
                digest,
                path: payload_path,
                bytes: bytes.len() as u64,
            },
        };
        index.snapshots.push(snapshot.clone());
        index.current = Some(index.snapshots.len() - 1);
        Self::save_index(&project, &index)?;

        tracing::info!(project = %project.display(), id = %snapshot.id, "snapshot created");
        Ok(snapshot)
    }

    /// Step the pointer back one snapshot, or jump straight to `snapshot_id`,
    /// and restore that payload onto the live project.
    pub fn undo(&self, project: &Path, snapshot_id: Option<&str>) -> Result<Snapshot, AppError> {
        let project = canonical_project_path(project)?;
        let guard = self.guard(&project);
        let _lock = guard.lock();

        let mut index = Self::load_index(&project)?;
        if index.snapshots.is_empty() {
            return Err(AppError::not_found(format!(
                "no snapshots recorded for {}",
                project.display()
            )));
        }
        let target = match snapshot_id {
            Some(id) => index
                .snapshots
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| AppError::not_found(format!("snapshot '{id}' not found")))?,
            None => match index.current {
                Some(current) if current > 0 => current - 1,
                _ => return Err(AppError::not_found("no earlier snapshot to undo to")),
            },
        };
        Self::restore(&project, &mut index, target)
    }

    /// Move the pointer forward one snapshot and restore it.
    pub fn redo(&self, project: &Path) -> Result<Snapshot, AppError> {
        let project = canonical_project_path(project)?;
        let guard = self.guard(&project);
        let _lock = guard.lock();

        let mut index = Self::load_index(&project)?;
        let target = match index.current {
            Some(current) if current + 1 < index.snapshots.len() => current + 1,
            _ => return Err(AppError::not_found("already at the newest snapshot; nothing to redo")),
        };
        Self::restore(&project, &mut index, target)
    }

    pub fn history(&self, project: &Path) -> Result<HistoryView, AppError> {
        let project = canonical_project_path(project)?;
        let guard = self.guard(&project);
        let _lock = guard.lock();

        let index = Self::load_index(&project)?;
        let current_id = index
            .current
            .and_then(|i| index.snapshots.get(i))
            .map(|s| s.id.clone());
        Ok(HistoryView {
            project_path: project,
            can_undo: index.current.is_some_and(|i| i > 0),
            can_redo: index.current.is_some_and(|i| i + 1 < index.snapshots.len()),
            current_index: index.current,
            current_id,
            snapshots: index.snapshots,
        })
    }

    /// Write the target payload over the live project, then move the pointer.
    /// A failed index update puts the previous live bytes back.
    fn restore(project: &Path, index: &mut HistoryIndex, target: usize) -> Result<Snapshot, AppError> {
        let snapshot = index
            .snapshots
            .get(target)
            .cloned()
            .ok_or_else(|| AppError::not_found("snapshot index out of range"))?;

        let payload = match read_project_bytes(&snapshot.payload.path) {
            Ok(bytes) => bytes,
            Err(ProjectError::Missing(_)) => {
                return Err(AppError::not_found(format!(
                    "payload for snapshot '{}' is missing",
                    snapshot.id
                )))
            }
            Err(e) => return Err(AppError::generic(e.to_string())),
        };
        if sha256_hex(&payload) != snapshot.payload.digest {
            return Err(AppError::generic(format!(
                "payload for snapshot '{}' is corrupt",
                snapshot.id
            )));
        }

        let previous = read_project_bytes(project).ok();
        atomic_write(project, &payload)
            .map_err(|e| AppError::generic(format!("failed to restore snapshot: {e}")))?;

        let old_current = index.current;
        index.current = Some(target);
        if let Err(e) = Self::save_index(project, index) {
            index.current = old_current;
            if let Some(previous) = previous {
                let _ = atomic_write(project, &previous);
            }
            return Err(e);
        }

        tracing::info!(project = %project.display(), id = %snapshot.id, "snapshot restored");
        Ok(snapshot)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testing::setup_test_dir;
    use std::fs;

    fn project_in(dir: &Path, contents: &[u8]) -> PathBuf {
        let path = dir.join("scene.proj");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_snapshot_undo_redo_round_trip() {
        let dir = setup_test_dir("history_roundtrip");
        let project = project_in(&dir, b"state A");
        let history = SnapshotManager::new();

        let a = history.create(&project, "A").unwrap();
        fs::write(&project, b"state B").unwrap();
        let b = history.create(&project, "B").unwrap();

        let undone = history.undo(&project, None).unwrap();
        assert_eq!(undone.id, a.id);
        assert_eq!(fs::read(&project).unwrap(), b"state A");

        let redone = history.redo(&project).unwrap();
        assert_eq!(redone.id, b.id);
        assert_eq!(fs::read(&project).unwrap(), b"state B");
        assert_eq!(redone.payload, b.payload);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_jump_then_create_truncates_redo_branch() {
        let dir = setup_test_dir("history_truncate");
        let project = project_in(&dir, b"v1");
        let history = SnapshotManager::new();

        let first = history.create(&project, "v1").unwrap();
        for v in ["v2", "v3", "v4"] {
            fs::write(&project, v).unwrap();
            history.create(&project, v).unwrap();
        }

        history.undo(&project, Some(&first.id)).unwrap();
        assert_eq!(fs::read(&project).unwrap(), b"v1");
        let view = history.history(&project).unwrap();
        assert_eq!(view.current_index, Some(0));
        assert!(view.can_redo);

        fs::write(&project, b"v5").unwrap();
        let newest = history.create(&project, "v5").unwrap();
        let view = history.history(&project).unwrap();
        assert_eq!(view.snapshots.len(), 2);
        assert_eq!(view.current_id.as_deref(), Some(newest.id.as_str()));

        let err = history.redo(&project).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redo_at_newest_and_undo_at_oldest_are_not_found() {
        let dir = setup_test_dir("history_edges");
        let project = project_in(&dir, b"only");
        let history = SnapshotManager::new();

        assert_eq!(history.undo(&project, None).unwrap_err().code(), ErrorCode::NotFound);
        history.create(&project, "only").unwrap();
        assert_eq!(history.redo(&project).unwrap_err().code(), ErrorCode::NotFound);
        assert_eq!(history.undo(&project, None).unwrap_err().code(), ErrorCode::NotFound);
        assert_eq!(
            history.undo(&project, Some("ffffffffffff")).unwrap_err().code(),
            ErrorCode::NotFound
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_create_requires_readable_project() {
        let dir = setup_test_dir("history_missing");
        let history = SnapshotManager::new();
        let err = history.create(&dir.join("absent.proj"), "x").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_history_survives_new_manager() {
        let dir = setup_test_dir("history_restart");
        let project = project_in(&dir, b"one");
        {
            let history = SnapshotManager::new();
            history.create(&project, "one").unwrap();
            fs::write(&project, b"two").unwrap();
            history.create(&project, "two").unwrap();
        }
        let restarted = SnapshotManager::new();
        let view = restarted.history(&project).unwrap();
        assert_eq!(view.snapshots.len(), 2);
        restarted.undo(&project, None).unwrap();
        assert_eq!(fs::read(&project).unwrap(), b"one");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_identical_payloads_share_storage() {
        let dir = setup_test_dir("history_dedupe");
        let project = project_in(&dir, b"same");
        let history = SnapshotManager::new();
        let a = history.create(&project, "a").unwrap();
        let b = history.create(&project, "b").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.payload.path, b.payload.path);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_payload_leaves_live_state_untouched() {
        let dir = setup_test_dir("history_corrupt");
        let project = project_in(&dir, b"good");
        let history = SnapshotManager::new();
        let a = history.create(&project, "good").unwrap();
        fs::write(&project, b"newer").unwrap();
        history.create(&project, "newer").unwrap();

        fs::write(&a.payload.path, b"tampered").unwrap();
        let err = history.undo(&project, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Error);
        assert_eq!(fs::read(&project).unwrap(), b"newer");
        assert_eq!(history.history(&project).unwrap().current_index, Some(1));
        let _ = fs::remove_dir_all(&dir);
    }
}
