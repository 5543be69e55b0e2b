//! Job storage trait and types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{Job, JobState, Task, TaskError, TaskState};
use crate::pipeline::{PipelineType, ProcessorRef};

/// Error type for job and task storage.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job or task not found.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Cannot perform operation due to current state. Nothing was written.
    #[error("Cannot {operation} {id}: current state is {current_state}")]
    InvalidState {
        id: String,
        current_state: String,
        operation: String,
    },

    /// Stored counters break their invariants. The transaction was rolled back.
    #[error("Counter inconsistency on job {job_id}: {detail}")]
    Consistency { job_id: String, detail: String },

    /// A concurrent writer changed the row first, or the database stayed
    /// locked past the busy timeout. Safe to retry.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl JobError {
    pub(crate) fn job_not_found(id: impl Into<String>) -> Self {
        JobError::NotFound {
            kind: "Job",
            id: id.into(),
        }
    }

    pub(crate) fn task_not_found(id: impl Into<String>) -> Self {
        JobError::NotFound {
            kind: "Task",
            id: id.into(),
        }
    }

    pub(crate) fn invalid_state(
        id: impl Into<String>,
        current_state: impl ToString,
        operation: impl Into<String>,
    ) -> Self {
        JobError::InvalidState {
            id: id.into(),
            current_state: current_state.to_string(),
            operation: operation.into(),
        }
    }
}

/// Request to create a job. The script is already resolved.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: String,
    pub entity_id: String,
    pub name: String,
    pub job_type: PipelineType,
    pub pipelines: Vec<String>,
    pub script: Vec<ProcessorRef>,
    pub priority: u16,
    pub created_by: String,
}

/// A task to materialize when a job starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub script: Vec<ProcessorRef>,
    pub assets: Vec<String>,
}

/// One guarded task state change.
///
/// Applied only if the task is still in `expected`; otherwise the store
/// reports [`JobError::Conflict`].
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub task_id: String,
    pub expected: TaskState,
    pub target: TaskState,
    /// Exit status to record with a terminal state.
    pub exit_status: Option<i32>,
}

/// Result of an applied task transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub task: Task,
    pub job: Job,
    pub previous_task_state: TaskState,
    pub previous_job_state: JobState,
}

/// Result of a job start.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub job: Job,
    pub tasks: Vec<Task>,
}

/// Result of a job cancellation.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub job: Job,
    pub previous_state: JobState,
    /// Tasks moved to `Skipped` by the cancellation.
    pub skipped_task_ids: Vec<String>,
}

/// Result of adding a task to a started job.
#[derive(Debug, Clone)]
pub struct ExpandOutcome {
    pub job: Job,
    pub task: Task,
    pub previous_job_state: JobState,
}

/// An error reported by a worker against one of its tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskErrorSpec {
    pub message: String,
    pub asset_id: Option<String>,
    pub path: Option<String>,
    pub processor: Option<String>,
    pub fatal: bool,
    pub phase: Option<String>,
}

impl TaskErrorSpec {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_asset(mut self, asset_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.asset_id = Some(asset_id.into());
        self.path = Some(path.into());
        self
    }

    pub fn with_processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = Some(processor.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// Filter for querying task errors.
#[derive(Debug, Clone, Default)]
pub struct TaskErrorFilter {
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    pub limit: i64,
}

impl TaskErrorFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    pub entity_id: Option<String>,
    pub state: Option<JobState>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub job_id: Option<String>,
    pub state: Option<TaskState>,
    pub host: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for job and task storage backends.
///
/// Every method that changes task state also updates the owning job's
/// counters and state in the same atomic unit, guarded by the job's
/// `version`. Losing a race surfaces as [`JobError::Conflict`].
pub trait JobStore: Send + Sync {
    /// Insert a new job in `Waiting`.
    fn create_job(&self, job: NewJob) -> Result<Job, JobError>;

    fn get_job(&self, id: &str) -> Result<Option<Job>, JobError>;

    /// List jobs, newest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobError>;

    fn get_task(&self, id: &str) -> Result<Option<Task>, JobError>;

    /// List tasks by job and ordinal.
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, JobError>;

    /// Insert the job's tasks and move it from `Waiting` to `Active`.
    ///
    /// Fails with `InvalidState` if the job is no longer `Waiting`.
    fn start_job(&self, job_id: &str, tasks: Vec<TaskSpec>) -> Result<StartOutcome, JobError>;

    /// Append a `Waiting` task to an `Active` or `Finished` job, reopening
    /// a finished one. `InvalidState` for jobs that are not started or were
    /// cancelled.
    fn expand_job(&self, job_id: &str, task: TaskSpec) -> Result<ExpandOutcome, JobError>;

    /// Apply one task state change together with its counter delta and the
    /// resulting job state.
    fn apply_task_transition(
        &self,
        transition: &TaskTransition,
    ) -> Result<TransitionOutcome, JobError>;

    /// Cancel a `Waiting` or `Active` job, skipping its non-terminal tasks.
    ///
    /// Cancelling a cancelled job returns it unchanged; a finished job is
    /// `InvalidState`.
    fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome, JobError>;

    /// Claim up to `limit` waiting tasks of active jobs for `host`, highest
    /// job priority first, then oldest job, then task ordinal.
    fn queue_tasks(&self, host: &str, limit: i64) -> Result<Vec<Task>, JobError>;

    /// Refresh `pinged_at` on the given tasks that are queued or running.
    /// Returns how many were pinged.
    fn ping_tasks(&self, task_ids: &[String]) -> Result<usize, JobError>;

    /// Queued or running tasks of active jobs not pinged since `older_than`.
    fn orphaned_tasks(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, JobError>;

    /// Record a task error and bump the task and job error counts.
    fn record_task_error(
        &self,
        task_id: &str,
        error: TaskErrorSpec,
    ) -> Result<TaskError, JobError>;

    /// Task errors, oldest first.
    fn list_task_errors(&self, filter: &TaskErrorFilter) -> Result<Vec<TaskError>, JobError>;
}
