//! The single entry point every call goes through, whether it arrives over
//! HTTP or from a plan step.
//!
//! A call is decoded, resolved against the registry, validated, and then run
//! on its own task. Mutating calls that address a project hold that project's
//! lock for the whole handler, host round-trip included. The caller waits at
//! most the call's timeout; past that the response is `BRIDGE_UNAVAILABLE`
//! and the task is left to finish (or, if it never got the lock, to give up).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::audit;
use crate::envelope::{check_protocol_version, decode_request, RpcRequest, RpcResponse};
use crate::error::AppError;
use crate::orchestrator::RpcTransport;
use crate::project::canonical_project_path;
use crate::state::{BridgeState, LastOutput};

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<BridgeState>,
}

impl Dispatcher {
    pub fn new(state: Arc<BridgeState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// Decode a raw body and dispatch it. Never fails: every problem becomes
    /// an `ok=false` envelope.
    pub async fn handle_bytes(&self, raw: &[u8]) -> RpcResponse {
        match decode_request(raw) {
            Ok(request) => self.dispatch(request).await,
            Err((correlation_id, error)) => {
                tracing::info!(correlation_id = %correlation_id, code = %error.code(), "rejected rpc envelope: {error}");
                if self.state.settings.audit {
                    audit::log_rpc_call(
                        &self.state.state_dir,
                        &correlation_id,
                        "",
                        Some(error.code()),
                        Duration::ZERO,
                    );
                }
                RpcResponse::failure(correlation_id, &error)
            }
        }
    }

    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let started = Instant::now();
        let correlation_id = request.id.clone();
        let method = request.method.clone();

        let outcome = self.execute(request).await;
        let elapsed = started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let (response, code) = match outcome {
            Ok(result) => {
                tracing::info!(method = %method, correlation_id = %correlation_id, elapsed_ms, "rpc ok");
                (RpcResponse::success(correlation_id.clone(), result), None)
            }
            Err(error) => {
                tracing::info!(
                    method = %method,
                    correlation_id = %correlation_id,
                    code = %error.code(),
                    elapsed_ms,
                    "rpc failed: {error}"
                );
                (RpcResponse::failure(correlation_id.clone(), &error), Some(error.code()))
            }
        };

        if self.state.settings.audit {
            audit::log_rpc_call(&self.state.state_dir, &correlation_id, &method, code, elapsed);
        }
        response
    }

    async fn execute(&self, request: RpcRequest) -> Result<Value, AppError> {
        if let Some(version) = &request.protocol_version {
            check_protocol_version(version)?;
        }
        let (method, descriptor) = self.state.registry.resolve(&request.method, &request.params)?;
        let name = descriptor.name;
        let mutates = descriptor.mutates;
        let project = method.project().map(canonical_project_path).transpose()?;

        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.state.settings.default_timeout_ms);
        let abandoned = Arc::new(AtomicBool::new(false));

        let state = Arc::clone(&self.state);
        let task_abandoned = Arc::clone(&abandoned);
        let correlation_id = request.id;
        let handle = tokio::spawn(async move {
            let _guard = match (&project, mutates) {
                (Some(project), true) => {
                    tracing::debug!(method = name, project = %project.display(), "waiting for project lock");
                    Some(state.locks.acquire(project).await)
                }
                _ => None,
            };
            if task_abandoned.load(Ordering::SeqCst) {
                tracing::debug!(method = name, "call abandoned before the handler started");
                return Err(AppError::unavailable(format!("'{name}' was abandoned after its timeout")));
            }
            tracing::debug!(method = name, "handler started");
            let output = method.dispatch(&state).await?;
            tracing::debug!(method = name, "{}", output.message);
            if let (true, Some(project)) = (mutates, &project) {
                state.record_output(
                    project,
                    LastOutput {
                        method: name.to_string(),
                        correlation_id,
                        at: Utc::now(),
                        result: output.result.clone(),
                    },
                );
            }
            Ok(output.result)
        });

        match tokio::time::timeout(Duration::from_millis(timeout_ms), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!(method = name, "handler task failed: {join_error}");
                Err(AppError::generic(format!("handler for '{name}' crashed")))
            }
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                tracing::warn!(method = name, timeout_ms, "rpc timed out");
                Err(AppError::unavailable(format!(
                    "'{name}' did not complete within {timeout_ms}ms"
                )))
            }
        }
    }
}

#[async_trait]
impl RpcTransport for Dispatcher {
    async fn call(&self, request: RpcRequest) -> RpcResponse {
        self.dispatch(request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::host::{HostAdapter, HostError, LocalHost};
    use crate::testing::{setup_test_dir, test_state, test_state_with_host};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    /// Wraps the local host and records any overlap of calls per project.
    struct OverlapRecorder {
        inner: LocalHost,
        in_flight: Mutex<HashMap<PathBuf, usize>>,
        overlaps: Mutex<Vec<String>>,
    }

    impl OverlapRecorder {
        fn new() -> Self {
            Self {
                inner: LocalHost::with_latency(Duration::from_millis(15)),
                in_flight: Mutex::new(HashMap::new()),
                overlaps: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HostAdapter for OverlapRecorder {
        fn name(&self) -> &'static str {
            "overlap-recorder"
        }

        async fn invoke(
            &self,
            operation: &str,
            project: Option<&Path>,
            params: Value,
        ) -> Result<Value, HostError> {
            if operation == "scene.object.delete" {
                panic!("host refuses deletes");
            }
            let key = project.map(Path::to_path_buf).unwrap_or_default();
            {
                let mut in_flight = self.in_flight.lock();
                let count = in_flight.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count > 1 && operation != "project.inspect" {
                    self.overlaps.lock().push(operation.to_string());
                }
            }
            let result = self.inner.invoke(operation, project, params).await;
            if let Some(count) = self.in_flight.lock().get_mut(&key) {
                *count -= 1;
            }
            result
        }
    }

    fn request(id: u64, method: &str, params: Value) -> RpcRequest {
        RpcRequest::new(id, method, params)
    }

    #[tokio::test]
    async fn test_correlation_id_and_ok_error_exclusivity() {
        let dir = setup_test_dir("dispatch_envelope");
        let dispatcher = Dispatcher::new(test_state(&dir));

        let ok = dispatcher.dispatch(request(7, "system.health", json!({}))).await;
        assert!(ok.ok);
        assert_eq!(ok.correlation_id, json!(7));
        assert!(ok.result.is_some() && ok.error.is_none());

        let missing = dispatcher.dispatch(request(8, "no.such.method", json!({}))).await;
        assert!(!missing.ok);
        assert_eq!(missing.correlation_id, json!(8));
        assert_eq!(missing.error_code(), Some(ErrorCode::NotFound));
        assert!(missing.result.is_none());

        let bad = dispatcher.handle_bytes(b"{not json").await;
        assert_eq!(bad.error_code(), Some(ErrorCode::InvalidInput));

        let aliased = dispatcher
            .handle_bytes(br#"{"correlationId":"abc","method":"system.version"}"#)
            .await;
        assert!(aliased.ok);
        assert_eq!(aliased.correlation_id, json!("abc"));
    }

    #[tokio::test]
    async fn test_protocol_major_mismatch_is_rejected() {
        let dir = setup_test_dir("dispatch_protocol");
        let dispatcher = Dispatcher::new(test_state(&dir));
        let mut req = request(1, "system.health", json!({}));
        req.protocol_version = Some("2.0.0".into());
        let resp = dispatcher.dispatch(req).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidInput));
    }

    #[tokio::test]
    async fn test_param_errors_never_reach_handler() {
        let dir = setup_test_dir("dispatch_params");
        let dispatcher = Dispatcher::new(test_state(&dir));
        let project = dir.join("p.proj");

        let resp = dispatcher
            .dispatch(request(1, "scene.object.add", json!({"project": project, "primitive": 3})))
            .await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidInput));

        let resp = dispatcher
            .dispatch(request(2, "scene.object.add", json!({"project": project})))
            .await;
        assert_eq!(resp.error_code(), Some(ErrorCode::ValidationFailed));
        assert!(!project.exists());
    }

    #[tokio::test]
    async fn test_extreme_frame_range_is_validation_failure() {
        let dir = setup_test_dir("dispatch_frame_extremes");
        let dispatcher = Dispatcher::new(test_state(&dir));
        let project = dir.join("p.proj");
        dispatcher
            .dispatch(request(0, "project.new", json!({"output": project})))
            .await;

        let resp = dispatcher
            .dispatch(request(
                1,
                "render.animation",
                json!({
                    "project": project,
                    "output": dir.join("frames.png"),
                    "frameStart": i64::MIN,
                    "frameEnd": i64::MAX,
                }),
            ))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.correlation_id, json!(1));
        assert_eq!(resp.error_code(), Some(ErrorCode::ValidationFailed));

        let jobs = dispatcher.dispatch(request(2, "job.list", json!({}))).await;
        assert_eq!(jobs.result.unwrap()["count"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_never_interleave() {
        let dir = setup_test_dir("dispatch_reentrancy");
        let recorder = Arc::new(OverlapRecorder::new());
        let state = test_state_with_host(&dir, recorder.clone());
        let dispatcher = Dispatcher::new(state);
        let project = dir.join("p.proj");
        assert!(dispatcher
            .dispatch(request(0, "project.new", json!({"output": project})))
            .await
            .ok);

        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let d = dispatcher.clone();
            let project = project.clone();
            tasks.push(tokio::spawn(async move {
                d.dispatch(request(i + 1, "scene.object.add", json!({"project": project, "primitive": "CUBE"})))
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().ok);
        }

        assert!(recorder.overlaps.lock().is_empty(), "overlapping calls: {:?}", recorder.overlaps.lock());
        let listed = dispatcher
            .dispatch(request(99, "scene.object.list", json!({"project": project})))
            .await;
        assert_eq!(listed.result.unwrap()["count"], 8);
    }

    #[tokio::test]
    async fn test_read_only_calls_ignore_held_lock() {
        let dir = setup_test_dir("dispatch_readonly");
        let state = test_state(&dir);
        let dispatcher = Dispatcher::new(Arc::clone(&state));
        let project = dir.join("p.proj");
        dispatcher
            .dispatch(request(0, "project.new", json!({"output": project})))
            .await;

        let canonical = canonical_project_path(&project).unwrap();
        let guard = state.locks.acquire(&canonical).await;

        let inspect = dispatcher
            .dispatch(request(1, "project.inspect", json!({"project": project})).with_timeout_ms(Some(2_000)))
            .await;
        assert!(inspect.ok);

        // Lock wait counts against the timeout; the add is abandoned and never runs
        let add = dispatcher
            .dispatch(
                request(2, "scene.object.add", json!({"project": project, "primitive": "CUBE"}))
                    .with_timeout_ms(Some(100)),
            )
            .await;
        assert_eq!(add.error_code(), Some(ErrorCode::BridgeUnavailable));

        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let listed = dispatcher
            .dispatch(request(3, "scene.object.list", json!({"project": project})))
            .await;
        assert_eq!(listed.result.unwrap()["count"], 0);
    }

    #[tokio::test]
    async fn test_handler_panic_is_error_and_releases_lock() {
        let dir = setup_test_dir("dispatch_panic");
        let state = test_state_with_host(&dir, Arc::new(OverlapRecorder::new()));
        let dispatcher = Dispatcher::new(state);
        let project = dir.join("p.proj");
        dispatcher
            .dispatch(request(0, "project.new", json!({"output": project})))
            .await;

        let crashed = dispatcher
            .dispatch(request(1, "scene.object.delete", json!({"project": project, "name": "Cube"})))
            .await;
        assert_eq!(crashed.error_code(), Some(ErrorCode::Error));

        let after = dispatcher
            .dispatch(
                request(2, "scene.object.add", json!({"project": project, "primitive": "CUBE"}))
                    .with_timeout_ms(Some(2_000)),
            )
            .await;
        assert!(after.ok);
    }

    #[tokio::test]
    async fn test_mutating_success_records_last_output() {
        let dir = setup_test_dir("dispatch_last_output");
        let dispatcher = Dispatcher::new(test_state(&dir));
        let project = dir.join("p.proj");
        dispatcher
            .dispatch(request(0, "project.new", json!({"output": project})))
            .await;
        dispatcher
            .dispatch(request(5, "scene.object.add", json!({"project": project, "primitive": "CUBE", "name": "C1"})))
            .await;

        let status = dispatcher
            .dispatch(request(6, "project.status", json!({"project": project})))
            .await;
        let result = status.result.unwrap();
        assert_eq!(result["lastOutput"]["method"], "scene.object.add");
        assert_eq!(result["lastOutput"]["correlationId"], 5);
        assert_eq!(result["lastOutput"]["result"]["object"]["name"], "C1");
    }

    #[tokio::test]
    async fn test_host_domain_error_keeps_specific_code() {
        let dir = setup_test_dir("dispatch_domain");
        let dispatcher = Dispatcher::new(test_state(&dir));
        let resp = dispatcher
            .dispatch(request(1, "project.inspect", json!({"project": dir.join("absent.proj")})))
            .await;
        assert_eq!(resp.error_code(), Some(ErrorCode::NotFound));
    }
}
