use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::EngineConfig;
use crate::pipeline::{CreatePipelineRequest, PipelineType, ProcessorRef};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Pipelines installed at startup when missing.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// How long a writer waits on a locked database (milliseconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("conveyor.db")
}

fn default_busy_timeout() -> u64 {
    5000
}

/// Stall monitor configuration.
///
/// The monitor fails queued or running tasks whose state has not changed
/// for `stall_timeout_secs`, as if their worker had reported a failure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    /// Maximum tasks failed per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: default_poll_interval(),
            stall_timeout_secs: default_stall_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_stall_timeout() -> u64 {
    3600 // 1 hour
}

fn default_batch_size() -> i64 {
    100
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// A pipeline declared in the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub tenant_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    #[serde(default)]
    pub standard: bool,
    #[serde(default)]
    pub description: Option<String>,
    pub processors: Vec<ProcessorRef>,
}

impl PipelineConfig {
    pub fn to_request(&self) -> CreatePipelineRequest {
        CreatePipelineRequest {
            tenant_id: self.tenant_id.clone(),
            name: self.name.clone(),
            pipeline_type: self.pipeline_type,
            is_standard: self.standard,
            description: self.description.clone(),
            processors: self.processors.clone(),
        }
    }
}
