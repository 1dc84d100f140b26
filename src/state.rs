use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::history::SnapshotManager;
use crate::host::HostAdapter;
use crate::jobs::JobManager;
use crate::locks::ProjectLocks;
use crate::registry::{Registry, RegistryError};
use crate::settings::BridgeSettings;

// ── Last output ────────────────────────────────────────────────────

/// Most recent successful mutating call against a project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOutput {
    pub method: String,
    pub correlation_id: Value,
    pub at: DateTime<Utc>,
    pub result: Value,
}

// ── Bridge State ───────────────────────────────────────────────────

/// State shared by the dispatcher, the HTTP API and every handler.
pub struct BridgeState {
    pub settings: BridgeSettings,
    pub state_dir: PathBuf,
    pub registry: Registry,
    pub host: Arc<dyn HostAdapter>,
    pub history: SnapshotManager,
    pub jobs: JobManager,
    pub locks: Arc<ProjectLocks>,
    /// Keyed by canonical project path.
    activity: Mutex<HashMap<PathBuf, LastOutput>>,
    pub started_at: Instant,
}

impl BridgeState {
    /// Build the shared state. Fails only if the method table has a duplicate.
    pub fn new(
        settings: BridgeSettings,
        state_dir: PathBuf,
        host: Arc<dyn HostAdapter>,
    ) -> Result<Arc<Self>, RegistryError> {
        let registry = Registry::builtin()?;
        let locks = Arc::new(ProjectLocks::new());
        Ok(Arc::new(Self {
            settings,
            state_dir,
            registry,
            host,
            history: SnapshotManager::new(),
            jobs: JobManager::new(Arc::clone(&locks)),
            locks,
            activity: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }))
    }

    pub fn record_output(&self, project: &Path, output: LastOutput) {
        self.activity.lock().insert(project.to_path_buf(), output);
    }

    pub fn last_output(&self, project: &Path) -> Option<LastOutput> {
        self.activity.lock().get(project).cloned()
    }

    pub fn uptime_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}
