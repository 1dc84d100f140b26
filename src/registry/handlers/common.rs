use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::error::AppError;
use crate::project::canonical_project_path;
use crate::registry::MethodOutput;
use crate::state::BridgeState;

/// Canonical project path for handler use.
pub fn project_path(path: &Path) -> Result<PathBuf, AppError> {
    Ok(canonical_project_path(path)?)
}

/// Forward one operation to the host and wrap its result.
pub async fn host_call(
    state: &Arc<BridgeState>,
    operation: &str,
    project: &Path,
    args: Value,
) -> Result<MethodOutput, AppError> {
    let project = project_path(project)?;
    let result = state.host.invoke(operation, Some(&project), args).await?;
    Ok(MethodOutput::new(
        format!("{operation} on {}", project.display()),
        result,
    ))
}
