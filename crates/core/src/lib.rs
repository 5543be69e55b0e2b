pub mod audit;
pub mod config;
pub mod engine;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod testing;

mod sqlite;

pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditFilter, AuditHandle, AuditRecord,
    AuditStore, AuditWriter, SqliteAuditStore,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, DatabaseConfig,
    LogFormat, LoggingConfig, MonitorConfig, PipelineConfig,
};
pub use engine::{EngineConfig, EngineError, JobEngine, JobSpec, TaskGrouping, TaskReport};
pub use job::{
    Job, JobCounts, JobError, JobFilter, JobState, JobStore, SqliteJobStore, Task, TaskError,
    TaskErrorFilter, TaskErrorSpec, TaskFilter, TaskSpec, TaskState,
};
pub use pipeline::{
    CreatePipelineRequest, Pipeline, PipelineError, PipelineFilter, PipelineStore, PipelineType,
    ProcessorRef, SqlitePipelineStore,
};
