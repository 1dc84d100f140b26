use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::error::AppError;
use crate::registry::params::{JobIdParams, JobListParams, JobStatusParams};
use crate::registry::MethodOutput;
use crate::state::BridgeState;

/// Longest a single `job.status` call may block.
const MAX_WAIT_MS: u64 = 60_000;

pub async fn status(state: &Arc<BridgeState>, p: JobStatusParams) -> Result<MethodOutput, AppError> {
    let job = match p.wait_ms {
        Some(ms) if ms > 0 => {
            state
                .jobs
                .wait(&p.job_id, Duration::from_millis(ms.min(MAX_WAIT_MS)))
                .await?
        }
        _ => state.jobs.status(&p.job_id)?,
    };
    MethodOutput::json(format!("Job {} is {}", job.id, job.status.as_str()), &job)
}

pub async fn cancel(state: &Arc<BridgeState>, p: JobIdParams) -> Result<MethodOutput, AppError> {
    let job = state.jobs.cancel(&p.job_id)?;
    let message = if job.status.is_terminal() {
        format!("Job {} already {}", job.id, job.status.as_str())
    } else {
        format!("Cancellation requested for job {}", job.id)
    };
    MethodOutput::json(message, &job)
}

pub async fn list(state: &Arc<BridgeState>, p: JobListParams) -> Result<MethodOutput, AppError> {
    let jobs = state.jobs.list(p.status);
    Ok(MethodOutput::new(
        format!("{} jobs", jobs.len()),
        json!({ "count": jobs.len(), "jobs": jobs }),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testing::{setup_test_dir, test_state};

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = setup_test_dir("job_unknown");
        let state = test_state(&dir);
        let err = status(
            &state,
            JobStatusParams {
                job_id: "job_never_issued".into(),
                wait_ms: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.code().exit_code(), 2);

        let err = cancel(&state, JobIdParams { job_id: "job_never_issued".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let out = list(&state, JobListParams { status: None }).await.unwrap();
        assert_eq!(out.result["count"], 0);
    }
}
