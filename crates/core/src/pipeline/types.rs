//! Core pipeline data types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a pipeline is meant for.
///
/// Each type has its own set of standard pipelines, used when a job is
/// submitted without explicit pipeline names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Import,
    Export,
    Batch,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::Import => "import",
            PipelineType::Export => "export",
            PipelineType::Batch => "batch",
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(PipelineType::Import),
            "export" => Ok(PipelineType::Export),
            "batch" => Ok(PipelineType::Batch),
            other => Err(format!("unknown pipeline type: {}", other)),
        }
    }
}

/// Reference to a single processing step.
///
/// The engine only stores and sequences these; workers are the ones that
/// know how to execute `class_name` with `args`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorRef {
    /// Fully qualified processor class or module name.
    pub class_name: String,
    /// Arguments passed to the processor.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, serde_json::Value>,
}

impl ProcessorRef {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// A named, ordered list of processors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub id: String,
    pub tenant_id: String,
    /// Unique per tenant, case-sensitive.
    pub name: String,
    pub pipeline_type: PipelineType,
    /// Standard pipelines run when a job names no pipeline.
    pub is_standard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub processors: Vec<ProcessorRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a new pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatePipelineRequest {
    pub tenant_id: String,
    pub name: String,
    pub pipeline_type: PipelineType,
    #[serde(default)]
    pub is_standard: bool,
    #[serde(default)]
    pub description: Option<String>,
    pub processors: Vec<ProcessorRef>,
}

impl CreatePipelineRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        pipeline_type: PipelineType,
        processors: Vec<ProcessorRef>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            name: name.into(),
            pipeline_type,
            is_standard: false,
            description: None,
            processors,
        }
    }

    /// Mark the pipeline as a default for its type.
    pub fn standard(mut self) -> Self {
        self.is_standard = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
