//! Expansion of pipeline names into processor lists.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::{PipelineError, PipelineFilter, PipelineStore, PipelineType, ProcessorRef};

/// Page size used when scanning for standard pipelines.
const DEFAULT_SCAN_PAGE: i64 = 100;

/// The outcome of resolving a job's pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScript {
    /// Pipeline names that were actually expanded, in expansion order.
    pub pipelines: Vec<String>,
    /// Concatenated processors.
    pub processors: Vec<ProcessorRef>,
}

/// Read-only view over a [`PipelineStore`] that turns names into scripts.
pub struct PipelineResolver {
    store: Arc<dyn PipelineStore>,
}

impl PipelineResolver {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Concatenate the processors of every named pipeline, in input order.
    ///
    /// A name appearing twice contributes its processors twice. Any unknown
    /// name fails the whole resolution.
    pub fn resolve_execute(
        &self,
        tenant_id: &str,
        names: &[String],
    ) -> Result<Vec<ProcessorRef>, PipelineError> {
        let mut processors = Vec::new();

        for name in names {
            let pipeline = self
                .store
                .get(tenant_id, name)?
                .ok_or_else(|| PipelineError::NotFound(name.clone()))?;
            processors.extend(pipeline.processors);
        }

        debug!(
            tenant_id = %tenant_id,
            pipelines = names.len(),
            processors = processors.len(),
            "Resolved pipelines"
        );

        Ok(processors)
    }

    /// Names of the tenant's standard pipelines for a type.
    pub fn default_pipeline_names(
        &self,
        tenant_id: &str,
        pipeline_type: PipelineType,
    ) -> Result<BTreeSet<String>, PipelineError> {
        let mut names = BTreeSet::new();
        let mut offset = 0;

        loop {
            let filter = PipelineFilter::new()
                .with_type(pipeline_type)
                .standard_only()
                .with_limit(DEFAULT_SCAN_PAGE)
                .with_offset(offset);
            let page = self.store.list(tenant_id, &filter)?;
            let page_len = page.len() as i64;

            names.extend(page.into_iter().map(|p| p.name));

            if page_len < DEFAULT_SCAN_PAGE {
                break;
            }
            offset += page_len;
        }

        Ok(names)
    }

    /// Resolve `names`, or the type's standard pipelines when `names` is empty.
    ///
    /// A type without standard pipelines resolves to an empty script.
    pub fn resolve_or_default(
        &self,
        tenant_id: &str,
        pipeline_type: PipelineType,
        names: &[String],
    ) -> Result<ResolvedScript, PipelineError> {
        let pipelines: Vec<String> = if names.is_empty() {
            self.default_pipeline_names(tenant_id, pipeline_type)?
                .into_iter()
                .collect()
        } else {
            names.to_vec()
        };

        let processors = self.resolve_execute(tenant_id, &pipelines)?;

        Ok(ResolvedScript {
            pipelines,
            processors,
        })
    }
}
