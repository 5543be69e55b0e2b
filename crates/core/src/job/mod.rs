//! Jobs, their tasks, and the counters that tie them together.

mod aggregator;
mod sqlite_store;
mod store;
mod types;

pub use aggregator::next_job_state;
pub use sqlite_store::SqliteJobStore;
pub use store::{
    CancelOutcome, ExpandOutcome, JobError, JobFilter, JobStore, NewJob, StartOutcome,
    TaskErrorFilter, TaskErrorSpec, TaskFilter, TaskSpec, TaskTransition, TransitionOutcome,
};
pub use types::{Job, JobCounts, JobState, Task, TaskError, TaskState, DEFAULT_PRIORITY};
