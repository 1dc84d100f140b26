use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard for one project's mutation lock. Dropping it releases the lock,
/// which also happens when the holding task unwinds.
pub type ProjectGuard = OwnedMutexGuard<()>;

/// One async mutex per canonical project path. Paths never contend with
/// each other; entries live for the lifetime of the process.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, project: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(project.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the project's mutation lock. `project` must already be canonical.
    pub async fn acquire(&self, project: &Path) -> ProjectGuard {
        let slot = self.slot(project);
        slot.lock_owned().await
    }

    /// Whether a mutation currently holds the lock. Racy by nature; used for
    /// status reporting only.
    pub fn is_locked(&self, project: &Path) -> bool {
        let slot = {
            let locks = self.locks.lock();
            locks.get(project).cloned()
        };
        slot.is_some_and(|s| s.try_lock().is_err())
    }
}
