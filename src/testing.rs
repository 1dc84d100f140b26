#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::host::{HostAdapter, LocalHost};
use crate::settings::BridgeSettings;
use crate::state::BridgeState;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Fresh, empty temp directory unique to this process and call.
pub(crate) fn setup_test_dir(tag: &str) -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "harness_bridge_test_{tag}_{}_{}",
        std::process::id(),
        id
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Bridge state over the local stub host, with audit logging disabled.
pub(crate) fn test_state(dir: &std::path::Path) -> Arc<BridgeState> {
    test_state_with_host(dir, Arc::new(LocalHost::new()))
}

pub(crate) fn test_state_with_host(
    dir: &std::path::Path,
    host: Arc<dyn HostAdapter>,
) -> Arc<BridgeState> {
    let settings = BridgeSettings {
        audit: false,
        default_timeout_ms: 10_000,
        ..BridgeSettings::default()
    };
    BridgeState::new(settings, dir.join("state"), host).unwrap()
}
