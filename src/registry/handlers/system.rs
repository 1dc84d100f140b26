use std::sync::Arc;

use serde_json::{json, Value};

use crate::envelope::PROTOCOL_VERSION;
use crate::error::AppError;
use crate::registry::catalog;
use crate::registry::params::{MethodsParams, ValidateCallParams};
use crate::registry::MethodOutput;
use crate::state::BridgeState;

pub async fn health(state: &Arc<BridgeState>) -> Result<MethodOutput, AppError> {
    Ok(MethodOutput::new(
        "ok",
        json!({
            "status": "ok",
            "protocolVersion": PROTOCOL_VERSION,
            "uptimeMs": state.uptime_ms(),
        }),
    ))
}

pub async fn version(state: &Arc<BridgeState>) -> Result<MethodOutput, AppError> {
    Ok(MethodOutput::new(
        format!("harness-bridge {}", env!("CARGO_PKG_VERSION")),
        json!({
            "bridgeVersion": env!("CARGO_PKG_VERSION"),
            "protocolVersion": PROTOCOL_VERSION,
            "hostAdapter": state.host.name(),
        }),
    ))
}

pub async fn methods(state: &Arc<BridgeState>, p: MethodsParams) -> Result<MethodOutput, AppError> {
    let listing = catalog::describe(&state.registry, p.topic.as_deref())?;
    Ok(MethodOutput::new(
        format!("{} methods registered", state.registry.len()),
        listing,
    ))
}

/// Resolve and validate a call without running it.
pub async fn validate(
    state: &Arc<BridgeState>,
    p: ValidateCallParams,
) -> Result<MethodOutput, AppError> {
    let (_, descriptor) = state.registry.resolve(&p.method, &p.params)?;
    Ok(MethodOutput::new(
        format!("{} params are valid", descriptor.name),
        json!({
            "method": descriptor.name,
            "valid": true,
            "mutates": descriptor.mutates,
            "requiresProject": descriptor.requires_project,
            "projectParam": descriptor.project_param,
        }),
    ))
}

/// Host ping plus a state directory write check. Failing checks are
/// reported in the result, not as a call error.
pub async fn doctor(state: &Arc<BridgeState>) -> Result<MethodOutput, AppError> {
    let host_check = match state.host.invoke("system.ping", None, json!({})).await {
        Ok(detail) => json!({ "name": "host", "ok": true, "detail": detail }),
        Err(e) => json!({ "name": "host", "ok": false, "detail": e.to_string() }),
    };

    let probe = state.state_dir.join(".doctor-probe");
    let state_dir_check = match std::fs::create_dir_all(&state.state_dir)
        .and_then(|()| std::fs::write(&probe, b"ok"))
        .and_then(|()| std::fs::remove_file(&probe))
    {
        Ok(()) => json!({ "name": "stateDir", "ok": true, "detail": state.state_dir }),
        Err(e) => json!({ "name": "stateDir", "ok": false, "detail": e.to_string() }),
    };

    let checks = vec![host_check, state_dir_check];
    let healthy = checks.iter().all(|c| c.get("ok") == Some(&Value::Bool(true)));
    Ok(MethodOutput::new(
        if healthy { "all checks passed" } else { "some checks failed" },
        json!({
            "healthy": healthy,
            "hostAdapter": state.host.name(),
            "checks": checks,
        }),
    ))
}
