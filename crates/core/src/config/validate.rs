use std::collections::HashSet;

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Busy timeout and monitor intervals are not 0
/// - Bundled pipelines have a name and processors, and names are unique per tenant
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.database.busy_timeout_ms == 0 {
        return Err(ConfigError::ValidationError(
            "database.busy_timeout_ms cannot be 0".to_string(),
        ));
    }

    if config.monitor.enabled {
        if config.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.poll_interval_ms cannot be 0".to_string(),
            ));
        }
        if config.monitor.stall_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.stall_timeout_secs cannot be 0".to_string(),
            ));
        }
        if config.monitor.batch_size <= 0 {
            return Err(ConfigError::ValidationError(
                "monitor.batch_size must be positive".to_string(),
            ));
        }
    }

    let mut seen = HashSet::new();
    for pipeline in &config.pipelines {
        if pipeline.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "pipelines.name cannot be empty".to_string(),
            ));
        }
        if pipeline.processors.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "pipeline '{}' has no processors",
                pipeline.name
            )));
        }
        if !seen.insert((pipeline.tenant_id.as_str(), pipeline.name.as_str())) {
            return Err(ConfigError::ValidationError(format!(
                "pipeline '{}' is declared twice for tenant {}",
                pipeline.name, pipeline.tenant_id
            )));
        }
    }

    Ok(())
}
