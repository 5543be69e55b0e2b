//! Job engine.
//!
//! Ties pipeline resolution, job and task storage, metrics and the audit
//! trail together behind [`JobEngine`].

mod config;
mod lifecycle;
mod types;

pub use config::{EngineConfig, TaskGrouping};
pub use lifecycle::JobEngine;
pub use types::{EngineError, JobSpec, TaskReport};
