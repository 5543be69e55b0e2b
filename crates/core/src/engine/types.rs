//! Engine request, result and error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobError, Task};
use crate::pipeline::{PipelineError, PipelineType};

/// Errors returned by the job engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown pipeline, job or task.
    #[error("{0}")]
    NotFound(String),

    /// Operation not permitted in the current state. Nothing was modified.
    #[error("{0}")]
    InvalidState(String),

    /// Stored counters are inconsistent. The operation was rolled back.
    #[error("{0}")]
    Consistency(String),

    /// Malformed request.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Still losing concurrent updates after the configured retries.
    /// The caller may retry.
    #[error("Gave up after {attempts} conflicting attempts: {last}")]
    Transient { attempts: u32, last: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<JobError> for EngineError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound { .. } => EngineError::NotFound(e.to_string()),
            JobError::InvalidState { .. } => EngineError::InvalidState(e.to_string()),
            JobError::Consistency { .. } => EngineError::Consistency(e.to_string()),
            JobError::Conflict(last) => EngineError::Transient { attempts: 1, last },
            JobError::Database(msg) => EngineError::Storage(msg),
        }
    }
}

impl From<PipelineError> for EngineError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotFound(_) => EngineError::NotFound(e.to_string()),
            PipelineError::AlreadyExists(_) | PipelineError::Invalid(_) => {
                EngineError::Validation(e.to_string())
            }
            PipelineError::Database(msg) | PipelineError::Serialization(msg) => {
                EngineError::Storage(msg)
            }
        }
    }
}

/// A request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub tenant_id: String,
    pub entity_id: String,
    pub name: String,
    /// Pipeline names to run, in order. Empty selects the type's standard
    /// pipelines.
    #[serde(default)]
    pub pipelines: Vec<String>,
    pub job_type: PipelineType,
    /// Falls back to the engine's default priority.
    #[serde(default)]
    pub priority: Option<u16>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_created_by() -> String {
    "system".to_string()
}

impl JobSpec {
    pub fn new(
        tenant_id: impl Into<String>,
        entity_id: impl Into<String>,
        name: impl Into<String>,
        job_type: PipelineType,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            entity_id: entity_id.into(),
            name: name.into(),
            pipelines: Vec::new(),
            job_type,
            priority: None,
            created_by: default_created_by(),
        }
    }

    pub fn with_pipelines<I, S>(mut self, pipelines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipelines = pipelines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn created_by(mut self, user: impl Into<String>) -> Self {
        self.created_by = user.into();
        self
    }
}

/// Outcome of a task state report.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: Task,
    pub job: Job,
    /// False when the report was a duplicate or arrived too late to matter.
    pub applied: bool,
}
