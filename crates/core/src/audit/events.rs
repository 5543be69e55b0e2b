use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Pipeline definitions
    PipelineCreated {
        tenant_id: String,
        pipeline_id: String,
        name: String,
        pipeline_type: String,
        is_standard: bool,
        /// Number of processors in the pipeline
        processors: usize,
    },

    // Job lifecycle
    JobCreated {
        job_id: String,
        tenant_id: String,
        entity_id: String,
        name: String,
        /// Effective pipeline names (explicit or standard)
        pipelines: Vec<String>,
        /// Number of processors in the resolved script
        processors: usize,
        priority: u16,
        created_by: String,
    },
    JobStateChanged {
        job_id: String,
        from_state: String,
        to_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    JobCancelled {
        job_id: String,
        previous_state: String,
        /// Tasks moved to skipped by the cancellation
        skipped_tasks: usize,
    },

    // Task lifecycle
    TasksCreated {
        job_id: String,
        count: usize,
        /// Grouping policy used to split the script
        grouping: String,
    },
    TaskStateChanged {
        job_id: String,
        task_id: String,
        from_state: String,
        to_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<i32>,
    },
    TaskRetried {
        job_id: String,
        task_id: String,
        retry_count: i64,
    },
    TasksQueued {
        /// Worker that claimed the tasks
        host: String,
        task_ids: Vec<String>,
    },
    TaskExpanded {
        job_id: String,
        task_id: String,
        name: String,
    },
    TaskErrorReported {
        job_id: String,
        task_id: String,
        message: String,
        fatal: bool,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::PipelineCreated { .. } => "pipeline_created",
            Self::JobCreated { .. } => "job_created",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::TasksCreated { .. } => "tasks_created",
            Self::TaskStateChanged { .. } => "task_state_changed",
            Self::TaskRetried { .. } => "task_retried",
            Self::TasksQueued { .. } => "tasks_queued",
            Self::TaskExpanded { .. } => "task_expanded",
            Self::TaskErrorReported { .. } => "task_error_reported",
        }
    }

    /// Extract job_id if this event is job-related
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobCreated { job_id, .. }
            | Self::JobStateChanged { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::TasksCreated { job_id, .. }
            | Self::TaskStateChanged { job_id, .. }
            | Self::TaskRetried { job_id, .. }
            | Self::TaskExpanded { job_id, .. }
            | Self::TaskErrorReported { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// Extract user_id if this event was triggered by a user action
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::JobCreated { created_by, .. } => Some(created_by),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub job_id: Option<String>,
    pub user_id: Option<String>,
    pub data: AuditEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_service_started() {
        let event = AuditEvent::ServiceStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc123".to_string(),
        };
        assert_eq!(event.event_type(), "service_started");
        assert_eq!(event.job_id(), None);
        assert_eq!(event.user_id(), None);
    }

    #[test]
    fn test_event_type_job_created() {
        let event = AuditEvent::JobCreated {
            job_id: "job-123".to_string(),
            tenant_id: "tenant".to_string(),
            entity_id: "entity".to_string(),
            name: "ingest".to_string(),
            pipelines: vec!["standard".to_string()],
            processors: 2,
            priority: 100,
            created_by: "user-456".to_string(),
        };
        assert_eq!(event.event_type(), "job_created");
        assert_eq!(event.job_id(), Some("job-123"));
        assert_eq!(event.user_id(), Some("user-456"));
    }

    #[test]
    fn test_event_type_task_state_changed() {
        let event = AuditEvent::TaskStateChanged {
            job_id: "job-123".to_string(),
            task_id: "task-1".to_string(),
            from_state: "running".to_string(),
            to_state: "failure".to_string(),
            exit_status: Some(2),
        };
        assert_eq!(event.event_type(), "task_state_changed");
        assert_eq!(event.job_id(), Some("job-123"));
        assert_eq!(event.user_id(), None);
    }

    #[test]
    fn test_tasks_queued_has_no_job() {
        let event = AuditEvent::TasksQueued {
            host: "worker-1".to_string(),
            task_ids: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(event.event_type(), "tasks_queued");
        assert_eq!(event.job_id(), None);
    }

    #[test]
    fn test_serialization_tag() {
        let event = AuditEvent::JobStateChanged {
            job_id: "job-123".to_string(),
            from_state: "active".to_string(),
            to_state: "finished".to_string(),
            reason: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"job_state_changed\""));
        assert!(!json.contains("reason"));

        let deserialized: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "job_state_changed");
    }
}
