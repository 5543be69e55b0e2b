//! Pipeline storage trait and types.

use thiserror::Error;

use super::{CreatePipelineRequest, Pipeline, PipelineType, ProcessorRef};

/// Error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Pipeline not found by name or ID.
    #[error("Pipeline not found: {0}")]
    NotFound(String),

    /// A pipeline with the same name already exists for the tenant.
    #[error("Pipeline already exists: {0}")]
    AlreadyExists(String),

    /// Invalid pipeline definition.
    #[error("Invalid pipeline: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Filter for listing pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineFilter {
    pub pipeline_type: Option<PipelineType>,
    pub standard_only: bool,
    pub limit: i64,
    pub offset: i64,
}

impl PipelineFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, pipeline_type: PipelineType) -> Self {
        self.pipeline_type = Some(pipeline_type);
        self
    }

    pub fn standard_only(mut self) -> Self {
        self.standard_only = true;
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

/// Trait for pipeline storage backends.
///
/// Every lookup is scoped to a tenant; names are unique within a tenant.
pub trait PipelineStore: Send + Sync {
    /// Create a new pipeline.
    fn create(&self, request: CreatePipelineRequest) -> Result<Pipeline, PipelineError>;

    /// Get a pipeline by name.
    fn get(&self, tenant_id: &str, name: &str) -> Result<Option<Pipeline>, PipelineError>;

    /// Get a pipeline by ID.
    fn get_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Pipeline>, PipelineError>;

    /// Check whether a pipeline name is taken.
    fn exists(&self, tenant_id: &str, name: &str) -> Result<bool, PipelineError>;

    /// Count the tenant's pipelines.
    fn count(&self, tenant_id: &str) -> Result<i64, PipelineError>;

    /// List pipelines ordered by name.
    fn list(&self, tenant_id: &str, filter: &PipelineFilter)
        -> Result<Vec<Pipeline>, PipelineError>;

    /// Replace a pipeline's processor list.
    ///
    /// Tasks already created keep their own copy of the old list.
    fn update_processors(
        &self,
        tenant_id: &str,
        name: &str,
        processors: Vec<ProcessorRef>,
    ) -> Result<Pipeline, PipelineError>;

    /// Flag or unflag a pipeline as standard for its type.
    fn set_standard(
        &self,
        tenant_id: &str,
        name: &str,
        is_standard: bool,
    ) -> Result<Pipeline, PipelineError>;
}
