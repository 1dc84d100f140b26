//! Asynchronous work tracked independently of the RPC call that started it.
//!
//! A job is owned by the [`JobManager`] from submission until it reaches a
//! terminal status. Work runs on its own tokio task, holds the project's
//! mutation lock while it runs, and observes cancellation cooperatively
//! through [`JobContext::checkpoint`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ErrorBody;
use crate::error::AppError;
use crate::locks::ProjectLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted and waiting for the project lock.
    Queued,
    /// Work unit is executing.
    Running,
    /// Work unit returned a result.
    Succeeded,
    /// Work unit returned an error or panicked.
    Failed,
    /// Work unit observed a cancel request.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true when the job cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    fn stage(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::Cancelled => 2,
        }
    }
}

/// Filter accepted by `job.list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatusFilter {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Any of `succeeded`, `failed`, `cancelled`.
    Terminal,
    /// Any of `queued`, `running`.
    Active,
}

impl JobStatusFilter {
    pub fn matches(self, status: JobStatus) -> bool {
        match self {
            Self::Queued => status == JobStatus::Queued,
            Self::Running => status == JobStatus::Running,
            Self::Succeeded => status == JobStatus::Succeeded,
            Self::Failed => status == JobStatus::Failed,
            Self::Cancelled => status == JobStatus::Cancelled,
            Self::Terminal => status.is_terminal(),
            Self::Active => !status.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub completed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub project_path: PathBuf,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
}

/// The work a handler hands to [`JobManager::submit`].
pub type JobWork = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<Value, AppError>> + Send>;

/// Box an async closure as [`JobWork`].
pub fn job_work<F, Fut>(f: F) -> JobWork
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

struct JobSlot {
    job: Job,
    cancel: Arc<AtomicBool>,
    /// Every status the job has held, in order.
    trail: Vec<JobStatus>,
}

impl JobSlot {
    /// Apply a transition if it moves exactly one stage forward.
    fn advance(&mut self, next: JobStatus) -> bool {
        let current = self.job.status;
        if current.is_terminal() || next.stage() != current.stage() + 1 {
            tracing::warn!(job = %self.job.id, from = current.as_str(), to = next.as_str(), "rejected job transition");
            return false;
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => self.job.started_at = Some(now),
            _ => self.job.finished_at = Some(now),
        }
        self.job.status = next;
        self.trail.push(next);
        tracing::info!(job = %self.job.id, kind = %self.job.kind, status = next.as_str(), "job transition");
        true
    }
}

type JobTable = Mutex<IndexMap<String, JobSlot>>;

/// Handle given to a running work unit.
#[derive(Clone)]
pub struct JobContext {
    id: String,
    kind: String,
    cancel: Arc<AtomicBool>,
    table: Arc<JobTable>,
}

impl JobContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Cooperative cancellation point. Work should call this between units
    /// of mutation and propagate the error with `?`.
    pub fn checkpoint(&self) -> Result<(), AppError> {
        if self.is_cancel_requested() {
            return Err(AppError::Cancelled {
                operation: self.kind.clone(),
            });
        }
        Ok(())
    }

    pub fn report_progress(&self, completed: u64, total: u64) {
        if let Some(slot) = self.table.lock().get_mut(&self.id) {
            slot.job.progress = Some(JobProgress { completed, total });
        }
    }
}

pub struct JobManager {
    table: Arc<JobTable>,
    locks: Arc<ProjectLocks>,
}

fn new_job_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("job_{}", raw.chars().take(12).collect::<String>())
}

impl JobManager {
    pub fn new(locks: Arc<ProjectLocks>) -> Self {
        Self {
            table: Arc::new(Mutex::new(IndexMap::new())),
            locks,
        }
    }

    /// Register a job and start its work on a separate task. Returns the job
    /// as submitted (status `queued`) without waiting for the work.
    pub fn submit(&self, kind: &str, project: &Path, work: JobWork) -> Job {
        let id = new_job_id();
        let cancel = Arc::new(AtomicBool::new(false));
        let job = Job {
            id: id.clone(),
            kind: kind.to_string(),
            project_path: project.to_path_buf(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            cancel_requested: false,
            progress: None,
        };
        self.table.lock().insert(
            id.clone(),
            JobSlot {
                job: job.clone(),
                cancel: Arc::clone(&cancel),
                trail: vec![JobStatus::Queued],
            },
        );
        tracing::info!(job = %id, kind, project = %project.display(), "job queued");

        let ctx = JobContext {
            id,
            kind: kind.to_string(),
            cancel,
            table: Arc::clone(&self.table),
        };
        tokio::spawn(run_job(Arc::clone(&self.locks), project.to_path_buf(), ctx, work));
        job
    }

    pub fn status(&self, id: &str) -> Result<Job, AppError> {
        self.table
            .lock()
            .get(id)
            .map(|slot| slot.job.clone())
            .ok_or_else(|| AppError::not_found(format!("job '{id}' not found")))
    }

    /// Request cancellation. Returns immediately; a terminal job is returned
    /// unchanged.
    pub fn cancel(&self, id: &str) -> Result<Job, AppError> {
        let mut table = self.table.lock();
        let slot = table
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(format!("job '{id}' not found")))?;
        if !slot.job.status.is_terminal() {
            slot.cancel.store(true, Ordering::SeqCst);
            slot.job.cancel_requested = true;
            tracing::info!(job = %id, "job cancel requested");
        }
        Ok(slot.job.clone())
    }

    /// Jobs in submission order, optionally filtered by status.
    pub fn list(&self, filter: Option<JobStatusFilter>) -> Vec<Job> {
        self.table
            .lock()
            .values()
            .filter(|slot| filter.map_or(true, |f| f.matches(slot.job.status)))
            .map(|slot| slot.job.clone())
            .collect()
    }

    /// Poll until the job is terminal or `wait` elapses, then return it.
    pub async fn wait(&self, id: &str, wait: Duration) -> Result<Job, AppError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let job = self.status(id)?;
            if job.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Every status the job has held so far, oldest first.
    pub fn status_trail(&self, id: &str) -> Result<Vec<JobStatus>, AppError> {
        self.table
            .lock()
            .get(id)
            .map(|slot| slot.trail.clone())
            .ok_or_else(|| AppError::not_found(format!("job '{id}' not found")))
    }
}

fn transition(table: &JobTable, id: &str, next: JobStatus, outcome: Option<Result<Value, AppError>>) {
    let mut table = table.lock();
    let Some(slot) = table.get_mut(id) else {
        return;
    };
    if !slot.advance(next) {
        return;
    }
    match outcome {
        Some(Ok(value)) => slot.job.result = Some(value),
        Some(Err(e)) => slot.job.error = Some(ErrorBody::from(&e)),
        None => {}
    }
}

async fn run_job(locks: Arc<ProjectLocks>, project: PathBuf, ctx: JobContext, work: JobWork) {
    let _guard = locks.acquire(&project).await;
    let table = Arc::clone(&ctx.table);
    let id = ctx.id.clone();
    transition(&table, &id, JobStatus::Running, None);

    let outcome = if ctx.is_cancel_requested() {
        Err(AppError::Cancelled {
            operation: ctx.kind.clone(),
        })
    } else {
        match tokio::spawn(work(ctx)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(AppError::generic(format!("job worker panicked: {e}"))),
        }
    };

    match outcome {
        Ok(value) => transition(&table, &id, JobStatus::Succeeded, Some(Ok(value))),
        Err(e) if e.is_cancelled() => transition(&table, &id, JobStatus::Cancelled, None),
        Err(e) => {
            tracing::warn!(job = %id, error = %e, "job failed");
            transition(&table, &id, JobStatus::Failed, Some(Err(e)));
        }
    }
}
