use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use super::common::{host_call, project_path};
use crate::error::AppError;
use crate::project::{atomic_write, read_project_bytes};
use crate::registry::params::{
    CopyProjectParams, DiffParams, NewProjectParams, ProjectParams, SnapshotParams, UndoParams,
};
use crate::registry::MethodOutput;
use crate::state::BridgeState;

pub async fn new_project(
    state: &Arc<BridgeState>,
    p: NewProjectParams,
) -> Result<MethodOutput, AppError> {
    host_call(state, "project.new", &p.output, json!({ "overwrite": p.overwrite })).await
}

/// Byte copy of the project file. History is not copied.
pub async fn copy_project(
    _state: &Arc<BridgeState>,
    p: CopyProjectParams,
) -> Result<MethodOutput, AppError> {
    let source = project_path(&p.source)?;
    let target = project_path(&p.target)?;
    if source == target {
        return Err(AppError::validation("source and target resolve to the same file"));
    }
    let bytes = read_project_bytes(&source)?;
    if target.exists() && !p.overwrite {
        return Err(AppError::generic(format!(
            "{} already exists (pass overwrite=true to replace it)",
            target.display()
        )));
    }
    atomic_write(&target, &bytes)?;
    Ok(MethodOutput::new(
        format!("Copied {} to {}", source.display(), target.display()),
        json!({ "source": source, "target": target, "bytes": bytes.len() }),
    ))
}

/// Remove the project file. Its history stays on disk.
pub async fn delete_project(
    _state: &Arc<BridgeState>,
    p: ProjectParams,
) -> Result<MethodOutput, AppError> {
    let project = project_path(&p.project)?;
    match std::fs::remove_file(&project) {
        Ok(()) => Ok(MethodOutput::new(
            format!("Deleted {}", project.display()),
            json!({ "project": project, "deleted": true }),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::not_found(format!(
            "project file {} not found",
            project.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

pub async fn inspect(state: &Arc<BridgeState>, p: ProjectParams) -> Result<MethodOutput, AppError> {
    host_call(state, "project.inspect", &p.project, json!({})).await
}

pub async fn validate_project(
    state: &Arc<BridgeState>,
    p: ProjectParams,
) -> Result<MethodOutput, AppError> {
    host_call(state, "project.validate", &p.project, json!({})).await
}

fn object_names(summary: &Value) -> BTreeSet<String> {
    summary
        .get("objects")
        .and_then(Value::as_array)
        .map(|objects| {
            objects
                .iter()
                .filter_map(|o| o.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn material_names(summary: &Value) -> BTreeSet<String> {
    summary
        .get("materials")
        .and_then(Value::as_array)
        .map(|materials| {
            materials
                .iter()
                .filter_map(|m| m.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn set_diff(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Value {
    json!({
        "added": after.difference(before).collect::<Vec<_>>(),
        "removed": before.difference(after).collect::<Vec<_>>(),
    })
}

/// Scene-level comparison of `source` (before) against `target` (after).
pub async fn diff(state: &Arc<BridgeState>, p: DiffParams) -> Result<MethodOutput, AppError> {
    let source = project_path(&p.source)?;
    let target = project_path(&p.target)?;
    let before = state.host.invoke("project.inspect", Some(&source), json!({})).await?;
    let after = state.host.invoke("project.inspect", Some(&target), json!({})).await?;

    let (objects_before, objects_after) = (object_names(&before), object_names(&after));
    let (materials_before, materials_after) = (material_names(&before), material_names(&after));
    let identical = objects_before == objects_after && materials_before == materials_after;

    Ok(MethodOutput::new(
        if identical { "no scene differences" } else { "scenes differ" },
        json!({
            "source": source,
            "target": target,
            "identical": identical,
            "objects": set_diff(&objects_before, &objects_after),
            "materials": set_diff(&materials_before, &materials_after),
        }),
    ))
}

pub async fn snapshot(state: &Arc<BridgeState>, p: SnapshotParams) -> Result<MethodOutput, AppError> {
    let project = project_path(&p.project)?;
    let description = p.description.as_deref().unwrap_or("manual snapshot");
    let snapshot = state.history.create(&project, description)?;
    MethodOutput::json(format!("Snapshot {} created", snapshot.id), &snapshot)
}

pub async fn undo(state: &Arc<BridgeState>, p: UndoParams) -> Result<MethodOutput, AppError> {
    let project = project_path(&p.project)?;
    let snapshot = state.history.undo(&project, p.snapshot_id.as_deref())?;
    MethodOutput::json(format!("Restored snapshot {}", snapshot.id), &snapshot)
}

pub async fn redo(state: &Arc<BridgeState>, p: ProjectParams) -> Result<MethodOutput, AppError> {
    let project = project_path(&p.project)?;
    let snapshot = state.history.redo(&project)?;
    MethodOutput::json(format!("Restored snapshot {}", snapshot.id), &snapshot)
}

pub async fn history(state: &Arc<BridgeState>, p: ProjectParams) -> Result<MethodOutput, AppError> {
    let project = project_path(&p.project)?;
    let view = state.history.history(&project)?;
    MethodOutput::json(format!("{} snapshots", view.snapshots.len()), &view)
}

pub async fn status(state: &Arc<BridgeState>, p: ProjectParams) -> Result<MethodOutput, AppError> {
    let project = project_path(&p.project)?;
    let history = state.history.history(&project)?;
    let locked = state.locks.is_locked(&project);
    Ok(MethodOutput::new(
        if locked { "mutation in flight" } else { "idle" },
        json!({
            "project": project,
            "exists": project.exists(),
            "locked": locked,
            "history": {
                "count": history.snapshots.len(),
                "currentId": history.current_id,
                "canUndo": history.can_undo,
                "canRedo": history.can_redo,
            },
            "lastOutput": state.last_output(&project),
        }),
    ))
}
