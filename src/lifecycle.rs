//! Starting, stopping and probing the bridge process.
//!
//! A running bridge is described by `<state_dir>/bridge.json`, written by the
//! serving process once its socket is bound and removed when it exits. The
//! record is only a hint: reachability of `/health` decides whether a bridge
//! is running, and a record whose bridge does not answer is stale.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;

use crate::client::BridgeClient;
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, ErrorCode};
use crate::host::build_host;
use crate::project::{read_json, write_json, ProjectError};
use crate::settings::BridgeSettings;
use crate::state::BridgeState;
use crate::{api, paths};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ── Lifecycle record ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRecord {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub started_at: DateTime<Utc>,
}

pub fn read_record(state_dir: &Path) -> Result<Option<LifecycleRecord>, AppError> {
    match read_json(&paths::lifecycle_record_path(state_dir)) {
        Ok(record) => Ok(Some(record)),
        Err(ProjectError::Missing(_)) => Ok(None),
        Err(e) => {
            tracing::warn!("ignoring unreadable lifecycle record: {e}");
            Ok(None)
        }
    }
}

pub fn write_record(state_dir: &Path, record: &LifecycleRecord) -> Result<(), AppError> {
    write_json(&paths::lifecycle_record_path(state_dir), record)?;
    Ok(())
}

pub fn remove_record(state_dir: &Path) {
    let _ = std::fs::remove_file(paths::lifecycle_record_path(state_dir));
}

/// Remove the record only if it still belongs to `pid`.
fn remove_own_record(state_dir: &Path, pid: u32) {
    if let Ok(Some(record)) = read_record(state_dir) {
        if record.pid == pid {
            remove_record(state_dir);
        }
    }
}

// ── Reports ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub running: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// A record was found but nothing answered; it has been removed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale_record: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub already_running: bool,
    pub status: BridgeStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub was_running: bool,
    /// Graceful shutdown did not finish within the grace period.
    pub forced: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    pub iterations: u32,
    pub max_failures: u32,
    pub pause: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            iterations: 25,
            max_failures: 0,
            pause: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub avg: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub iterations: u32,
    pub failures: u32,
    pub stable: bool,
    pub latency_ms: LatencyStats,
    pub errors: Vec<String>,
}

// ── Manager ──────────────────────────────────────────────────────

pub struct Lifecycle {
    state_dir: PathBuf,
    settings: BridgeSettings,
    client: BridgeClient,
}

impl Lifecycle {
    pub fn new(state_dir: PathBuf, settings: BridgeSettings) -> Result<Self, AppError> {
        let client = BridgeClient::new(settings.base_url())?;
        Ok(Self {
            state_dir,
            settings,
            client,
        })
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    /// One health check. Clears a stale record.
    pub async fn status(&self) -> BridgeStatus {
        let record = read_record(&self.state_dir).ok().flatten();
        match self.client.health(HEALTH_PROBE_TIMEOUT).await {
            Ok(health) => BridgeStatus {
                running: true,
                url: self.client.base_url().to_string(),
                pid: record.as_ref().map(|r| r.pid),
                started_at: record.map(|r| r.started_at),
                protocol_version: Some(health.protocol_version),
                stale_record: false,
            },
            Err(e) => {
                tracing::debug!("bridge not reachable: {e}");
                let stale_record = record.is_some();
                if stale_record {
                    remove_record(&self.state_dir);
                }
                BridgeStatus {
                    running: false,
                    url: self.client.base_url().to_string(),
                    pid: None,
                    started_at: None,
                    protocol_version: None,
                    stale_record,
                }
            }
        }
    }

    /// Spawn `<exe> bridge serve` in the background and wait for it to
    /// answer. A bridge that already answers is reported as-is.
    pub async fn start(&self, exe: &Path) -> Result<StartReport, AppError> {
        let current = self.status().await;
        if current.running {
            tracing::info!(url = %current.url, "bridge already running");
            return Ok(StartReport {
                already_running: true,
                status: current,
            });
        }

        std::fs::create_dir_all(&self.state_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths::bridge_log_path(&self.state_dir))?;

        let mut command = tokio::process::Command::new(exe);
        command
            .args(["bridge", "serve"])
            .env("HARNESS_BRIDGE_STATE_DIR", &self.state_dir)
            .env("HARNESS_BRIDGE_HOST", &self.settings.host)
            .env("HARNESS_BRIDGE_PORT", self.settings.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| AppError::unavailable(format!("failed to spawn bridge: {e}")))?;
        tracing::info!(pid = ?child.id(), url = %self.client.base_url(), "bridge spawned");

        let deadline = Instant::now() + Duration::from_millis(self.settings.startup_timeout_ms);
        loop {
            if let Ok(Some(exit)) = child.try_wait() {
                return Err(AppError::unavailable(format!(
                    "bridge exited during startup with {exit}; see {}",
                    paths::bridge_log_path(&self.state_dir).display()
                )));
            }
            if self.client.health(HEALTH_POLL_INTERVAL * 5).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(AppError::unavailable(format!(
                    "bridge did not become healthy within {}ms",
                    self.settings.startup_timeout_ms
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        Ok(StartReport {
            already_running: false,
            status: self.status().await,
        })
    }

    /// Graceful shutdown, then force-terminate after the grace period.
    pub async fn stop(&self) -> Result<StopReport, AppError> {
        let current = self.status().await;
        if !current.running {
            return Ok(StopReport {
                was_running: false,
                forced: false,
            });
        }

        if let Err(e) = self.client.shutdown().await {
            tracing::warn!("shutdown request failed: {e}");
        }
        let deadline = Instant::now() + Duration::from_millis(self.settings.shutdown_grace_ms);
        let mut forced = false;
        while self.client.health(HEALTH_POLL_INTERVAL * 5).await.is_ok() {
            if Instant::now() >= deadline {
                let Some(pid) = current.pid else {
                    return Err(AppError::generic(
                        "bridge ignored shutdown and its pid is unknown",
                    ));
                };
                tracing::warn!(pid, "grace period elapsed, terminating bridge");
                force_terminate(pid).await?;
                forced = true;
                break;
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
        remove_record(&self.state_dir);
        tracing::info!(forced, "bridge stopped");
        Ok(StopReport {
            was_running: true,
            forced,
        })
    }

    /// Repeat `system.doctor` and count the calls that fail or report an
    /// unhealthy host.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn verify(&self, options: VerifyOptions) -> Result<VerifyReport, AppError> {
        if options.iterations == 0 {
            return Err(AppError::invalid_input("iterations must be at least 1"));
        }
        let mut failures = 0;
        let mut errors = Vec::new();
        let mut latencies = Vec::with_capacity(options.iterations as usize);

        for i in 0..options.iterations {
            let started = Instant::now();
            let outcome = self
                .client
                .invoke(format!("verify-{}", i + 1), "system.doctor", json!({}))
                .await;
            latencies.push(started.elapsed().as_millis() as u64);
            let failure = match outcome {
                Ok(result) if result.get("healthy").and_then(serde_json::Value::as_bool) == Some(true) => None,
                Ok(result) => Some(format!("unhealthy: {result}")),
                Err(e) if e.code() == ErrorCode::BridgeUnavailable && i == 0 => return Err(e),
                Err(e) => Some(format!("{}: {e}", e.code())),
            };
            if let Some(message) = failure {
                failures += 1;
                if !errors.contains(&message) {
                    errors.push(message);
                }
            }
            if i + 1 < options.iterations {
                tokio::time::sleep(options.pause).await;
            }
        }

        let total: u64 = latencies.iter().sum();
        let report = VerifyReport {
            iterations: options.iterations,
            failures,
            stable: failures <= options.max_failures,
            latency_ms: LatencyStats {
                min: latencies.iter().copied().min().unwrap_or(0),
                max: latencies.iter().copied().max().unwrap_or(0),
                avg: total / u64::from(options.iterations),
            },
            errors,
        };
        tracing::info!(failures = report.failures, stable = report.stable, "verify finished");
        Ok(report)
    }
}

async fn force_terminate(pid: u32) -> Result<(), AppError> {
    if pid <= 1 || pid == std::process::id() || i32::try_from(pid).is_err() {
        return Err(AppError::generic(format!("refusing to terminate pid {pid}")));
    }
    let pid = pid.to_string();
    let status = if cfg!(windows) {
        tokio::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid])
            .status()
            .await
    } else {
        tokio::process::Command::new("kill").args(["-9", &pid]).status().await
    };
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(AppError::generic(format!("failed to terminate bridge pid {pid}: {s}"))),
        Err(e) => Err(AppError::generic(format!("failed to terminate bridge pid {pid}: {e}"))),
    }
}

// ── Foreground serving ───────────────────────────────────────────

/// Run the bridge in the foreground until shutdown. Writes the lifecycle
/// record once bound and removes it on the way out.
pub async fn serve(state_dir: PathBuf, settings: BridgeSettings) -> Result<(), AppError> {
    let addr = settings.socket_addr()?;
    let listener = api::bind(addr).await?;
    let local = listener.local_addr()?;

    let host = build_host(&settings.host_adapter);
    let host_name = host.name();
    let state = BridgeState::new(settings.clone(), state_dir.clone(), host)
        .map_err(|e| AppError::generic(format!("method registry: {e}")))?;

    let pid = std::process::id();
    write_record(
        &state_dir,
        &LifecycleRecord {
            pid,
            host: local.ip().to_string(),
            port: local.port(),
            url: format!("http://{local}"),
            started_at: Utc::now(),
        },
    )?;
    tracing::info!(%local, pid, host_adapter = host_name, "bridge listening");

    let served = api::serve(listener, Dispatcher::new(state), Arc::new(Notify::new())).await;
    remove_own_record(&state_dir, pid);
    tracing::info!("bridge stopped serving");
    served
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::testing::{setup_test_dir, test_state};
    use std::net::SocketAddr;

    fn sample_record(port: u16) -> LifecycleRecord {
        LifecycleRecord {
            pid: 4242,
            host: "127.0.0.1".into(),
            port,
            url: format!("http://127.0.0.1:{port}"),
            started_at: Utc::now(),
        }
    }

    fn settings_for(port: u16) -> BridgeSettings {
        BridgeSettings {
            port,
            startup_timeout_ms: 500,
            shutdown_grace_ms: 2_000,
            ..BridgeSettings::default()
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn in_process_bridge(dir: &Path) -> (u16, Arc<Notify>, tokio::task::JoinHandle<Result<(), AppError>>) {
        let listener = api::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(api::serve(
            listener,
            Dispatcher::new(test_state(dir)),
            Arc::clone(&shutdown),
        ));
        (port, shutdown, handle)
    }

    #[test]
    fn test_record_roundtrip_and_removal() {
        let dir = setup_test_dir("lifecycle_record");
        assert_eq!(read_record(&dir).unwrap(), None);
        let record = sample_record(41749);
        write_record(&dir, &record).unwrap();
        assert_eq!(read_record(&dir).unwrap(), Some(record));

        remove_own_record(&dir, 1);
        assert!(read_record(&dir).unwrap().is_some());
        remove_own_record(&dir, 4242);
        assert_eq!(read_record(&dir).unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_record_reports_not_running() {
        let dir = setup_test_dir("lifecycle_stale");
        let port = free_port();
        write_record(&dir, &sample_record(port)).unwrap();
        let lifecycle = Lifecycle::new(dir.clone(), settings_for(port)).unwrap();

        let status = lifecycle.status().await;
        assert!(!status.running);
        assert!(status.stale_record);
        assert_eq!(read_record(&dir).unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let dir = setup_test_dir("lifecycle_stop_idle");
        let lifecycle = Lifecycle::new(dir, settings_for(free_port())).unwrap();
        let report = lifecycle.stop().await.unwrap();
        assert!(!report.was_running);
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_when_running() {
        let dir = setup_test_dir("lifecycle_start_twice");
        let (port, shutdown, _) = in_process_bridge(&dir).await;
        let lifecycle = Lifecycle::new(dir, settings_for(port)).unwrap();

        // The executable is never spawned while a bridge answers.
        let missing_exe = Path::new("/nonexistent/harness-bridge");
        for _ in 0..2 {
            let report = lifecycle.start(missing_exe).await.unwrap();
            assert!(report.already_running);
            assert!(report.status.running);
        }
        shutdown.notify_one();
    }

    #[tokio::test]
    async fn test_start_failure_is_unavailable() {
        let dir = setup_test_dir("lifecycle_start_fail");
        let lifecycle = Lifecycle::new(dir, settings_for(free_port())).unwrap();
        let err = lifecycle
            .start(Path::new("/nonexistent/harness-bridge"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BridgeUnavailable);
    }

    #[tokio::test]
    async fn test_stop_shuts_down_gracefully() {
        let dir = setup_test_dir("lifecycle_stop");
        let (port, _, handle) = in_process_bridge(&dir).await;
        let lifecycle = Lifecycle::new(dir.clone(), settings_for(port)).unwrap();

        let report = lifecycle.stop().await.unwrap();
        assert!(report.was_running);
        assert!(!report.forced);
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(read_record(&dir).unwrap(), None);
        assert!(!lifecycle.status().await.running);
    }

    #[tokio::test]
    async fn test_force_terminate_refuses_reserved_pids() {
        assert!(force_terminate(0).await.is_err());
        assert!(force_terminate(1).await.is_err());
        assert!(force_terminate(std::process::id()).await.is_err());
        assert!(force_terminate(u32::MAX).await.is_err());
    }

    #[tokio::test]
    async fn test_verify_counts_no_failures_against_healthy_bridge() {
        let dir = setup_test_dir("lifecycle_verify");
        let (port, shutdown, _) = in_process_bridge(&dir).await;
        let lifecycle = Lifecycle::new(dir, settings_for(port)).unwrap();

        let report = lifecycle
            .verify(VerifyOptions {
                iterations: 5,
                max_failures: 0,
                pause: Duration::from_millis(1),
            })
            .await
            .unwrap();
        assert_eq!(report.iterations, 5);
        assert_eq!(report.failures, 0);
        assert!(report.stable);
        assert!(report.errors.is_empty());
        assert!(report.latency_ms.min <= report.latency_ms.max);
        shutdown.notify_one();
    }

    #[tokio::test]
    async fn test_verify_without_bridge_is_unavailable() {
        let dir = setup_test_dir("lifecycle_verify_down");
        let lifecycle = Lifecycle::new(dir, settings_for(free_port())).unwrap();
        let err = lifecycle.verify(VerifyOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BridgeUnavailable);
    }
}
