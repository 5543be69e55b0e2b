//! Job and task data types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::{PipelineType, ProcessorRef};

/// Default dispatch priority for new jobs.
pub const DEFAULT_PRIORITY: u16 = 100;

/// Aggregate state of a job.
///
/// ```text
/// Waiting -> Active -> Finished
///    |         |   ^      |
///    |         |   +------+  (reopened by a retry or an added task)
///    +---------+-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, no tasks yet.
    Waiting,
    /// Tasks exist and at least one is not terminal (or the job has none).
    Active,
    /// Every task reached a terminal state. May carry failures.
    Finished,
    /// Cancelled by a caller. Never left.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Finished => "finished",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "finished" => Ok(JobState::Finished),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// State of a single task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Queued,
    Running,
    Success,
    Failure,
    Skipped,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Waiting,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Success,
        TaskState::Failure,
        TaskState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failure => "failure",
            TaskState::Skipped => "skipped",
        }
    }

    /// Success, Failure and Skipped are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Skipped
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskState::Waiting),
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "success" => Ok(TaskState::Success),
            "failure" => Ok(TaskState::Failure),
            "skipped" => Ok(TaskState::Skipped),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// Per-state task counters of a job.
///
/// Kept in the job row and only changed together with the task row that
/// moved, so `waiting + queued + running + success + failure + skipped`
/// always equals `total`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub total: i64,
    pub waiting: i64,
    pub queued: i64,
    pub running: i64,
    pub success: i64,
    pub failure: i64,
    pub skipped: i64,
}

impl JobCounts {
    /// Tasks in a terminal state.
    pub fn done(&self) -> i64 {
        self.success + self.failure + self.skipped
    }

    /// Tasks not yet terminal.
    pub fn pending(&self) -> i64 {
        self.waiting + self.queued + self.running
    }

    pub fn get(&self, state: TaskState) -> i64 {
        match state {
            TaskState::Waiting => self.waiting,
            TaskState::Queued => self.queued,
            TaskState::Running => self.running,
            TaskState::Success => self.success,
            TaskState::Failure => self.failure,
            TaskState::Skipped => self.skipped,
        }
    }

    fn slot(&mut self, state: TaskState) -> &mut i64 {
        match state {
            TaskState::Waiting => &mut self.waiting,
            TaskState::Queued => &mut self.queued,
            TaskState::Running => &mut self.running,
            TaskState::Success => &mut self.success,
            TaskState::Failure => &mut self.failure,
            TaskState::Skipped => &mut self.skipped,
        }
    }

    /// Account for new tasks entering the job in `Waiting`.
    pub fn add_waiting(&mut self, count: i64) {
        self.total += count;
        self.waiting += count;
    }

    /// Move `count` tasks from one state counter to another.
    pub fn shift(&mut self, from: TaskState, to: TaskState, count: i64) {
        if from == to {
            return;
        }
        *self.slot(from) -= count;
        *self.slot(to) += count;
    }

    /// Describe the first broken counter invariant, if any.
    pub fn violation(&self) -> Option<String> {
        if let Some(state) = TaskState::ALL.iter().find(|s| self.get(**s) < 0) {
            return Some(format!("{} count is negative: {:?}", state, self));
        }
        if self.done() > self.total {
            return Some(format!(
                "terminal count {} exceeds total {}",
                self.done(),
                self.total
            ));
        }
        if self.done() + self.pending() != self.total {
            return Some(format!(
                "state counts sum to {} but total is {}",
                self.done() + self.pending(),
                self.total
            ));
        }
        None
    }
}

/// A request to process an entity with a list of pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    /// The entity (asset container) the job works on.
    pub entity_id: String,
    pub name: String,
    /// Type used to pick standard pipelines.
    pub job_type: PipelineType,
    /// Pipeline names as requested, or the standard ones when none were.
    pub pipelines: Vec<String>,
    /// Resolved processor list, copied into every task.
    pub script: Vec<ProcessorRef>,
    pub state: JobState,
    /// Higher is dispatched first.
    pub priority: u16,
    pub counts: JobCounts,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// When the job last became Finished or Cancelled.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Bumped on every counter or state change.
    pub version: i64,
    /// Task errors reported against the job's tasks.
    pub error_count: i64,
}

impl Job {
    /// True when every task is terminal and there is at least one.
    pub fn is_complete(&self) -> bool {
        self.counts.total > 0 && self.counts.done() == self.counts.total
    }
}

/// A unit of work executed by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    /// Position within the job, starting at 0.
    pub ordinal: i64,
    pub name: String,
    pub state: TaskState,
    pub script: Vec<ProcessorRef>,
    /// Asset IDs covered by this task. Empty means the whole entity.
    #[serde(default)]
    pub assets: Vec<String>,
    /// Worker that last claimed the task.
    pub host: Option<String>,
    pub exit_status: Option<i32>,
    /// Times the task was handed to a worker.
    pub run_count: i64,
    /// Times the task was retried after a failure.
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    /// Last state change or heartbeat, whichever is later.
    pub pinged_at: DateTime<Utc>,
    pub error_count: i64,
}

/// An error a worker hit while running a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub id: String,
    pub task_id: String,
    pub job_id: String,
    pub asset_id: Option<String>,
    pub path: Option<String>,
    pub message: String,
    pub processor: Option<String>,
    /// The task could not continue past this error.
    pub fatal: bool,
    pub phase: Option<String>,
    pub created_at: DateTime<Utc>,
}
