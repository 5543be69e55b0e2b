//! Named processor lists and their resolution into task scripts.

mod resolver;
mod sqlite_store;
mod store;
mod types;

pub use resolver::{PipelineResolver, ResolvedScript};
pub use sqlite_store::SqlitePipelineStore;
pub use store::{PipelineError, PipelineFilter, PipelineStore};
pub use types::{CreatePipelineRequest, Pipeline, PipelineType, ProcessorRef};
