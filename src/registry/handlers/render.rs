use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use super::common::project_path;
use crate::error::AppError;
use crate::host::HostAdapter;
use crate::jobs::{job_work, JobContext};
use crate::registry::params::{RenderAnimationParams, RenderStillParams};
use crate::registry::MethodOutput;
use crate::state::BridgeState;

/// Append `_####` to the file stem unless the path already has a `#` run.
fn animation_pattern(output: &Path) -> PathBuf {
    if output.to_string_lossy().contains('#') {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{stem}_####.{}", ext.to_string_lossy()),
        None => format!("{stem}_####"),
    };
    output.with_file_name(name)
}

/// Render `frames` one at a time, checking for cancellation before each.
async fn render_frames(
    ctx: JobContext,
    host: Arc<dyn HostAdapter>,
    project: PathBuf,
    output: PathBuf,
    frames: Vec<i64>,
) -> Result<Value, AppError> {
    let total = u64::try_from(frames.len()).unwrap_or(u64::MAX);
    let mut outputs = Vec::with_capacity(frames.len());
    for (done, frame) in (1u64..).zip(frames) {
        ctx.checkpoint()?;
        let result = host
            .invoke("render.frame", Some(&project), json!({ "frame": frame, "output": output }))
            .await?;
        outputs.push(result.get("output").cloned().unwrap_or(Value::Null));
        ctx.report_progress(done, total);
    }
    Ok(json!({ "frames": total, "outputs": outputs }))
}

fn submit(
    state: &Arc<BridgeState>,
    kind: &str,
    project: &Path,
    output: PathBuf,
    frames: Vec<i64>,
) -> Result<MethodOutput, AppError> {
    let project = project_path(project)?;
    if !project.is_file() {
        return Err(AppError::not_found(format!("project {} not found", project.display())));
    }
    let host = Arc::clone(&state.host);
    let target = project.clone();
    let job = state.jobs.submit(
        kind,
        &project,
        job_work(move |ctx| render_frames(ctx, host, target, output, frames)),
    );
    Ok(MethodOutput::new(
        format!("{kind} queued as {}", job.id),
        json!({ "jobId": job.id, "status": job.status }),
    ))
}

pub async fn still(state: &Arc<BridgeState>, p: RenderStillParams) -> Result<MethodOutput, AppError> {
    submit(state, "render.still", &p.project, p.output, vec![p.frame])
}

pub async fn animation(
    state: &Arc<BridgeState>,
    p: RenderAnimationParams,
) -> Result<MethodOutput, AppError> {
    let frames = p.frames();
    submit(state, "render.animation", &p.project, animation_pattern(&p.output), frames)
}
