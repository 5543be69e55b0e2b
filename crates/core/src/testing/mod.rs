//! Test fixtures for building an engine over in-memory stores.
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_core::testing::{fixtures, TestEngine};
//!
//! let harness = TestEngine::new();
//! fixtures::seed_pipeline(&harness.engine, "ingest", PipelineType::Import, &["fetch", "parse"], true);
//! let job = harness.engine.create(fixtures::job_spec("nightly", PipelineType::Import))?;
//! ```

use std::sync::Arc;

use crate::engine::{EngineConfig, JobEngine};
use crate::job::{JobStore, SqliteJobStore};
use crate::pipeline::{PipelineStore, SqlitePipelineStore};

/// Tenant used by fixtures unless a test picks its own.
pub const TEST_TENANT: &str = "0b9e6f4a-3c2d-4e1f-8a7b-6c5d4e3f2a1b";

/// A second tenant for isolation tests.
pub const OTHER_TENANT: &str = "7d8c9b0a-1f2e-4d3c-b4a5-968778695a4b";

/// An engine plus direct handles on its stores.
pub struct TestEngine {
    pub engine: JobEngine,
    pub jobs: Arc<SqliteJobStore>,
    pub pipelines: Arc<SqlitePipelineStore>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let jobs = Arc::new(SqliteJobStore::in_memory().expect("Failed to create job store"));
        let pipelines = Arc::new(
            SqlitePipelineStore::in_memory().expect("Failed to create pipeline store"),
        );
        let engine = JobEngine::new(
            Arc::clone(&jobs) as Arc<dyn JobStore>,
            Arc::clone(&pipelines) as Arc<dyn PipelineStore>,
            config,
        );

        Self {
            engine,
            jobs,
            pipelines,
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Request builders with reasonable defaults.
pub mod fixtures {
    use super::TEST_TENANT;
    use crate::engine::{JobEngine, JobSpec};
    use crate::pipeline::{CreatePipelineRequest, Pipeline, PipelineType, ProcessorRef};

    /// Processor references for the given class names.
    pub fn processors(class_names: &[&str]) -> Vec<ProcessorRef> {
        class_names.iter().map(|c| ProcessorRef::new(*c)).collect()
    }

    /// Register a pipeline for [`TEST_TENANT`].
    pub fn seed_pipeline(
        engine: &JobEngine,
        name: &str,
        pipeline_type: PipelineType,
        class_names: &[&str],
        standard: bool,
    ) -> Pipeline {
        let mut request =
            CreatePipelineRequest::new(TEST_TENANT, name, pipeline_type, processors(class_names));
        if standard {
            request = request.standard();
        }
        engine
            .create_pipeline(request)
            .expect("Failed to create pipeline")
    }

    /// A job for [`TEST_TENANT`] that runs the type's standard pipelines.
    pub fn job_spec(name: &str, job_type: PipelineType) -> JobSpec {
        JobSpec::new(TEST_TENANT, "entity-1", name, job_type).created_by("test")
    }
}
