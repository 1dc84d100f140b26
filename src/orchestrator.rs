//! Runs a [`Plan`] one step at a time through an [`RpcTransport`].
//!
//! The orchestrator has no private access to bridge state: steps, rollback
//! snapshots and restores are all ordinary RPC calls, so a plan contends for
//! project locks exactly like an external caller would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::envelope::{ErrorBody, RpcRequest, RpcResponse};
use crate::error::{AppError, ErrorCode};
use crate::plan::{resolve, Plan, Scope};

/// Anything that can carry one envelope to a dispatcher and bring one back.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, request: RpcRequest) -> RpcResponse;
}

/// History methods manage snapshots themselves; an automatic snapshot in
/// front of them would truncate the redo branch they operate on.
const HISTORY_METHODS: [&str; 3] = ["project.snapshot", "project.undo", "project.redo"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepMethod {
    name: String,
    mutates: bool,
    #[serde(default)]
    project_param: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// 1-based position in the plan.
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub method: String,
    pub ok: bool,
    pub mutates: bool,
    /// Params after substitution (and project injection).
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Snapshot taken just before this step ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Placeholders left unresolved because they reference steps that did not run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredProject {
    pub project: String,
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub project: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub attempted: bool,
    pub restored: Vec<RestoredProject>,
    /// Projects the plan created, deleted again.
    pub removed: Vec<String>,
    pub errors: Vec<RollbackFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReport {
    pub dry_run: bool,
    pub aborted: bool,
    /// Index of the first failed step, if any.
    pub failed_step: Option<usize>,
    pub step_results: Vec<StepResult>,
    pub rollback: RollbackReport,
}

impl PlanReport {
    /// Error of the first failed step.
    pub fn first_error(&self) -> Option<&ErrorBody> {
        self.step_results.iter().find_map(|s| s.error.as_ref())
    }
}

/// Earliest snapshot the plan took of one project, keyed by canonical path.
/// `None` when the project file did not exist yet.
type Baselines = IndexMap<String, Option<String>>;

pub struct Orchestrator {
    transport: Arc<dyn RpcTransport>,
    next_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value, timeout_ms: Option<u64>) -> Result<Value, AppError> {
        let id = format!("plan-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = RpcRequest::new(id, method, params).with_timeout_ms(timeout_ms);
        self.transport.call(request).await.into_result()
    }

    async fn methods(&self) -> Result<HashMap<String, StepMethod>, AppError> {
        #[derive(Deserialize)]
        struct Listing {
            methods: Vec<StepMethod>,
        }
        let listing: Listing = serde_json::from_value(self.call("system.methods", json!({}), None).await?)?;
        Ok(listing
            .methods
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect())
    }

    /// Execute (or, with `dryRun`, only resolve and validate) every step.
    ///
    /// Only failures that prevent starting at all are returned as `Err`;
    /// step failures are reported inside the [`PlanReport`].
    pub async fn run(&self, plan: Plan) -> Result<PlanReport, AppError> {
        plan.validate()?;
        let methods = self.methods().await?;
        let dry_run = plan.options.dry_run;
        let rollback_on_fail = plan.options.rollback_on_fail;

        let mut variables = plan.variables.clone();
        let project = plan_project(&plan, &variables)?;
        if let Some(project) = &project {
            variables
                .entry("project")
                .or_insert_with(|| Value::String(project.clone()));
        }

        let mut report = PlanReport {
            dry_run,
            aborted: false,
            failed_step: None,
            step_results: Vec::with_capacity(plan.steps.len()),
            rollback: RollbackReport::default(),
        };
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut pending: HashSet<String> = HashSet::new();
        let mut baselines = Baselines::new();

        tracing::info!(steps = plan.steps.len(), dry_run, rollback_on_fail, "plan started");

        for (i, step) in plan.steps.iter().enumerate() {
            let index = i + 1;
            let descriptor = methods.get(&step.method);
            let mutates = descriptor.is_some_and(|d| d.mutates);
            let mut result = StepResult {
                index,
                name: step.name.clone(),
                method: step.method.clone(),
                ok: false,
                mutates,
                params: step.params.clone(),
                result: None,
                error: None,
                snapshot_id: None,
                deferred: Vec::new(),
            };

            let scope = Scope {
                variables: &variables,
                outputs: &outputs,
                pending: &pending,
            };
            let outcome = match resolve(&step.params, &scope) {
                Ok(resolved) => {
                    let mut params = resolved.value;
                    inject_project(&mut params, descriptor, project.as_deref());
                    result.params = params.clone();
                    result.deferred = resolved.deferred;
                    if dry_run {
                        self.dry_run_step(&step.method, params, &result.deferred).await
                    } else {
                        self.execute_step(
                            &step.method,
                            params,
                            step.timeout_ms,
                            descriptor,
                            rollback_on_fail,
                            &mut baselines,
                            &mut result,
                        )
                        .await
                    }
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => {
                    result.ok = true;
                    if let Some(name) = &step.name {
                        if dry_run {
                            pending.insert(name.clone());
                        } else {
                            outputs.insert(name.clone(), value.clone());
                        }
                    }
                    result.result = Some(value);
                    report.step_results.push(result);
                }
                Err(error) => {
                    tracing::warn!(step = index, method = %step.method, code = %error.code(), "plan step failed: {error}");
                    result.error = Some(ErrorBody::from(&error));
                    report.step_results.push(result);
                    report.failed_step.get_or_insert(index);
                    if dry_run {
                        if let Some(name) = &step.name {
                            pending.insert(name.clone());
                        }
                        continue;
                    }
                    report.aborted = true;
                    if rollback_on_fail {
                        report.rollback = self.rollback(&baselines).await;
                    }
                    break;
                }
            }
        }

        tracing::info!(aborted = report.aborted, failed_step = ?report.failed_step, "plan finished");
        Ok(report)
    }

    async fn dry_run_step(&self, method: &str, params: Value, deferred: &[String]) -> Result<Value, AppError> {
        if !deferred.is_empty() {
            return Ok(json!({ "validated": false, "reason": "params reference steps that did not run" }));
        }
        self.call("system.validate", json!({ "method": method, "params": params }), None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
        descriptor: Option<&StepMethod>,
        rollback_on_fail: bool,
        baselines: &mut Baselines,
        result: &mut StepResult,
    ) -> Result<Value, AppError> {
        let target = descriptor
            .filter(|d| d.mutates && rollback_on_fail && !HISTORY_METHODS.contains(&d.name.as_str()))
            .and_then(|d| d.project_param.as_deref())
            .and_then(|param| params.get(param))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(project) = target {
            let description = format!("plan step {}: {method}", result.index);
            match self
                .call("project.snapshot", json!({ "project": project, "description": description }), None)
                .await
            {
                Ok(snapshot) => {
                    let id = snapshot.get("id").and_then(Value::as_str).map(str::to_string);
                    result.snapshot_id.clone_from(&id);
                    let key = match snapshot.get("projectPath").and_then(Value::as_str) {
                        Some(path) => path.to_string(),
                        None => self.canonical_project(&project).await?,
                    };
                    baselines.entry(key).or_insert(id);
                }
                Err(e) if e.code() == ErrorCode::NotFound => {
                    let key = self.canonical_project(&project).await?;
                    baselines.entry(key).or_insert(None);
                }
                Err(e) => return Err(e),
            }
        }

        self.call(method, params, timeout_ms).await
    }

    /// The bridge's canonical spelling of a project path.
    async fn canonical_project(&self, project: &str) -> Result<String, AppError> {
        let status = self.call("project.status", json!({ "project": project }), None).await?;
        Ok(status
            .get("project")
            .and_then(Value::as_str)
            .unwrap_or(project)
            .to_string())
    }

    /// Restore each touched project to the first snapshot the plan took of
    /// it, and delete projects the plan created.
    async fn rollback(&self, baselines: &Baselines) -> RollbackReport {
        let mut report = RollbackReport {
            attempted: true,
            ..RollbackReport::default()
        };
        for (project, baseline) in baselines {
            let Some(snapshot_id) = baseline else {
                match self.call("project.delete", json!({ "project": project }), None).await {
                    Ok(_) => {
                        tracing::info!(project = %project, "plan-created project removed");
                        report.removed.push(project.clone());
                    }
                    // Never created, so nothing to undo.
                    Err(e) if e.code() == ErrorCode::NotFound => {}
                    Err(e) => {
                        tracing::error!(project = %project, "plan rollback failed: {e}");
                        report.errors.push(RollbackFailure {
                            project: project.clone(),
                            error: ErrorBody::from(&e),
                        });
                    }
                }
                continue;
            };
            match self
                .call("project.undo", json!({ "project": project, "snapshotId": snapshot_id }), None)
                .await
            {
                Ok(_) => {
                    tracing::info!(project = %project, snapshot = %snapshot_id, "plan rolled back");
                    report.restored.push(RestoredProject {
                        project: project.clone(),
                        snapshot_id: snapshot_id.clone(),
                    });
                }
                Err(e) => {
                    tracing::error!(project = %project, "plan rollback failed: {e}");
                    report.errors.push(RollbackFailure {
                        project: project.clone(),
                        error: ErrorBody::from(&e),
                    });
                }
            }
        }
        report
    }
}

/// The plan project with placeholders resolved against the plan variables.
fn plan_project(plan: &Plan, variables: &Map<String, Value>) -> Result<Option<String>, AppError> {
    let template = match &plan.project_path {
        Some(template) => Value::String(template.clone()),
        None => return Ok(variables.get("project").and_then(Value::as_str).map(str::to_string)),
    };
    let outputs = HashMap::new();
    let pending = HashSet::new();
    let scope = Scope {
        variables,
        outputs: &outputs,
        pending: &pending,
    };
    match resolve(&template, &scope)?.value {
        Value::String(project) if !project.trim().is_empty() => Ok(Some(project)),
        other => Err(AppError::validation(format!(
            "projectPath must resolve to a non-empty string, got {other}"
        ))),
    }
}

/// Fill the method's project param from the plan project when the step
/// leaves it out.
fn inject_project(params: &mut Value, descriptor: Option<&StepMethod>, project: Option<&str>) {
    let (Some(param), Some(project), Value::Object(map)) = (
        descriptor.and_then(|d| d.project_param.as_deref()),
        project,
        params,
    ) else {
        return;
    };
    if !map.contains_key(param) {
        map.insert(param.to_string(), Value::String(project.to_string()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::testing::{setup_test_dir, test_state};
    use parking_lot::Mutex;
    use std::path::Path;

    /// Dispatcher transport that remembers every request it carried.
    struct Recording {
        inner: Dispatcher,
        seen: Mutex<Vec<RpcRequest>>,
    }

    #[async_trait]
    impl RpcTransport for Recording {
        async fn call(&self, request: RpcRequest) -> RpcResponse {
            self.seen.lock().push(request.clone());
            self.inner.call(request).await
        }
    }

    fn setup(tag: &str) -> (std::path::PathBuf, Arc<Recording>, Orchestrator) {
        let dir = setup_test_dir(tag);
        let recording = Arc::new(Recording {
            inner: Dispatcher::new(test_state(&dir)),
            seen: Mutex::new(Vec::new()),
        });
        let orchestrator = Orchestrator::new(recording.clone());
        (dir, recording, orchestrator)
    }

    fn plan(value: Value) -> Plan {
        serde_json::from_value(value).unwrap()
    }

    async fn object_names(orchestrator: &Orchestrator, project: &Path) -> Vec<String> {
        let listed = orchestrator
            .call("scene.object.list", json!({ "project": project }), None)
            .await
            .unwrap();
        listed["objects"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_variables_flow_into_dispatched_params() {
        let (dir, recording, orchestrator) = setup("plan_variables");
        let project = dir.join("p.proj");
        let report = orchestrator
            .run(plan(json!({
                "projectPath": project,
                "variables": { "cube": "C1" },
                "steps": [
                    { "method": "project.new", "params": { "output": "${project}" } },
                    { "method": "scene.object.add", "params": { "primitive": "CUBE", "name": "${cube}" } }
                ]
            })))
            .await
            .unwrap();

        assert!(!report.aborted, "{report:?}");
        assert_eq!(report.step_results.len(), 2);
        let sent = recording
            .seen
            .lock()
            .iter()
            .find(|r| r.method == "scene.object.add")
            .cloned()
            .unwrap();
        assert_eq!(sent.params["name"], "C1");
        assert_eq!(sent.params["project"], json!(project));
        assert_eq!(object_names(&orchestrator, &project).await, vec!["C1".to_string()]);
    }

    #[tokio::test]
    async fn test_step_outputs_feed_later_steps() {
        let (dir, _, orchestrator) = setup("plan_outputs");
        let project = dir.join("p.proj");
        let report = orchestrator
            .run(plan(json!({
                "project": project,
                "steps": [
                    { "method": "project.new" },
                    { "name": "first", "method": "scene.object.add", "params": { "primitive": "CUBE" } },
                    { "method": "scene.object.rename", "params": { "name": "${first.object.name}", "newName": "${first.object.name}-renamed" } }
                ]
            })))
            .await
            .unwrap();
        assert!(!report.aborted, "{report:?}");
        assert_eq!(object_names(&orchestrator, &project).await, vec!["Cube-renamed".to_string()]);
    }

    #[tokio::test]
    async fn test_third_of_five_fails_and_rolls_back() {
        let (dir, _, orchestrator) = setup("plan_rollback");
        let project = dir.join("p.proj");
        orchestrator
            .call("project.new", json!({ "output": project }), None)
            .await
            .unwrap();
        orchestrator
            .call("scene.object.add", json!({ "project": project, "primitive": "CUBE", "name": "Keep" }), None)
            .await
            .unwrap();
        let before = std::fs::read(&project).unwrap();

        let report = orchestrator
            .run(plan(json!({
                "project": project,
                "steps": [
                    { "method": "scene.object.add", "params": { "primitive": "CUBE", "name": "A" } },
                    { "method": "scene.object.add", "params": { "primitive": "CONE", "name": "B" } },
                    { "method": "scene.object.delete", "params": { "name": "Missing" } },
                    { "method": "scene.object.add", "params": { "primitive": "TORUS" } },
                    { "method": "scene.object.add", "params": { "primitive": "PLANE" } }
                ]
            })))
            .await
            .unwrap();

        assert!(report.aborted);
        assert_eq!(report.failed_step, Some(3));
        assert_eq!(report.step_results.len(), 3);
        assert!(!report.step_results[2].ok);
        assert_eq!(report.step_results[2].error.as_ref().unwrap().code, ErrorCode::NotFound);
        assert!(report.step_results[0].snapshot_id.is_some());
        assert!(report.rollback.attempted);
        assert_eq!(report.rollback.restored.len(), 1);
        assert!(report.rollback.errors.is_empty());
        assert_eq!(std::fs::read(&project).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failure_without_rollback_keeps_changes() {
        let (dir, _, orchestrator) = setup("plan_no_rollback");
        let project = dir.join("p.proj");
        let report = orchestrator
            .run(plan(json!({
                "project": project,
                "options": { "rollbackOnFail": false },
                "steps": [
                    { "method": "project.new" },
                    { "method": "scene.object.add", "params": { "primitive": "CUBE", "name": "A" } },
                    { "method": "scene.object.delete", "params": { "name": "Missing" } }
                ]
            })))
            .await
            .unwrap();
        assert!(report.aborted);
        assert!(!report.rollback.attempted);
        assert_eq!(object_names(&orchestrator, &project).await, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_project_created_by_plan_is_removed_on_rollback() {
        let (dir, _, orchestrator) = setup("plan_rollback_new");
        let project = dir.join("fresh.proj");
        let report = orchestrator
            .run(plan(json!({
                "project": project,
                "steps": [
                    { "method": "project.new" },
                    { "method": "scene.object.add", "params": { "primitive": "CUBE" } },
                    { "method": "scene.object.delete", "params": { "name": "Nothing" } }
                ]
            })))
            .await
            .unwrap();
        assert!(report.aborted);
        assert_eq!(report.rollback.removed.len(), 1);
        assert!(report.rollback.restored.is_empty());
        assert!(report.rollback.errors.is_empty());
        assert!(!project.exists());
    }

    #[tokio::test]
    async fn test_two_spellings_of_one_project_roll_back_to_first_state() {
        let (dir, _, orchestrator) = setup("plan_rollback_alias");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        let project = dir.join("p.proj");
        let alias = dir.join("sub").join("..").join("p.proj");
        orchestrator
            .call("project.new", json!({ "output": project }), None)
            .await
            .unwrap();
        let before = std::fs::read(&project).unwrap();

        let report = orchestrator
            .run(plan(json!({
                "steps": [
                    { "method": "scene.object.add", "params": { "project": project, "primitive": "CUBE", "name": "A" } },
                    { "method": "scene.object.add", "params": { "project": alias, "primitive": "CUBE", "name": "B" } },
                    { "method": "scene.object.delete", "params": { "project": project, "name": "Missing" } }
                ]
            })))
            .await
            .unwrap();

        assert_eq!(report.failed_step, Some(3));
        assert_eq!(report.rollback.restored.len(), 1);
        assert_eq!(report.rollback.restored[0].snapshot_id, report.step_results[0].snapshot_id.clone().unwrap());
        assert!(object_names(&orchestrator, &project).await.is_empty());
        assert_eq!(std::fs::read(&project).unwrap(), before);
    }

    #[tokio::test]
    async fn test_rollback_restores_every_touched_project() {
        let (dir, _, orchestrator) = setup("plan_rollback_multi");
        let first = dir.join("first.proj");
        let second = dir.join("second.proj");
        for project in [&first, &second] {
            orchestrator
                .call("project.new", json!({ "output": project }), None)
                .await
                .unwrap();
        }
        let first_before = std::fs::read(&first).unwrap();
        let second_before = std::fs::read(&second).unwrap();

        let report = orchestrator
            .run(plan(json!({
                "steps": [
                    { "method": "scene.object.add", "params": { "project": first, "primitive": "CUBE" } },
                    { "method": "scene.object.add", "params": { "project": second, "primitive": "CONE" } },
                    { "method": "scene.object.add", "params": { "project": first, "primitive": "TORUS" } },
                    { "method": "scene.object.delete", "params": { "project": second, "name": "Missing" } }
                ]
            })))
            .await
            .unwrap();

        assert!(report.aborted);
        assert_eq!(report.rollback.restored.len(), 2);
        assert!(report.rollback.errors.is_empty());
        assert_eq!(std::fs::read(&first).unwrap(), first_before);
        assert_eq!(std::fs::read(&second).unwrap(), second_before);
    }

    #[tokio::test]
    async fn test_unresolved_placeholder_fails_before_dispatch() {
        let (dir, recording, orchestrator) = setup("plan_unresolved");
        let project = dir.join("p.proj");
        let report = orchestrator
            .run(plan(json!({
                "project": project,
                "options": { "rollbackOnFail": false },
                "steps": [
                    { "method": "project.new" },
                    { "method": "scene.object.add", "params": { "primitive": "CUBE", "name": "${ghost}" } }
                ]
            })))
            .await
            .unwrap();
        assert_eq!(report.failed_step, Some(2));
        assert_eq!(
            report.step_results[1].error.as_ref().unwrap().code,
            ErrorCode::ValidationFailed
        );
        assert!(!recording.seen.lock().iter().any(|r| r.method == "scene.object.add"));
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing_and_reports_every_step() {
        let (dir, recording, orchestrator) = setup("plan_dry_run");
        let project = dir.join("p.proj");
        let report = orchestrator
            .run(plan(json!({
                "project": project,
                "variables": { "cube": "C1" },
                "options": { "dryRun": true },
                "steps": [
                    { "method": "project.new" },
                    { "name": "add", "method": "scene.object.add", "params": { "primitive": "CUBE", "name": "${cube}" } },
                    { "method": "scene.object.rename", "params": { "name": "${add.object.name}", "newName": "X" } },
                    { "method": "scene.object.add", "params": { "primitive": "NOPE" } }
                ]
            })))
            .await
            .unwrap();

        assert!(report.dry_run);
        assert!(!report.aborted);
        assert_eq!(report.step_results.len(), 4);
        assert_eq!(report.step_results[1].params["name"], "C1");
        assert_eq!(report.step_results[2].deferred, vec!["add.object.name".to_string()]);
        assert_eq!(report.failed_step, Some(4));
        assert_eq!(
            report.step_results[3].error.as_ref().unwrap().code,
            ErrorCode::ValidationFailed
        );
        assert!(!project.exists());
        let methods: Vec<String> = recording.seen.lock().iter().map(|r| r.method.clone()).collect();
        assert!(methods.iter().all(|m| m == "system.methods" || m == "system.validate"));
    }
}
