//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::job::DEFAULT_PRIORITY;

/// How a job's script is split into tasks at start.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskGrouping {
    /// One task carrying the whole script.
    #[default]
    WholeScript,
    /// One task per processor, in script order.
    PerProcessor,
}

impl TaskGrouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskGrouping::WholeScript => "whole_script",
            TaskGrouping::PerProcessor => "per_processor",
        }
    }
}

/// Configuration for the job engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub task_grouping: TaskGrouping,

    /// Extra attempts for an operation that lost a concurrent update before
    /// it fails as transient.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Accept jobs whose pipelines resolve to no processors.
    #[serde(default = "default_allow_empty_script")]
    pub allow_empty_script: bool,

    /// Priority of jobs submitted without one.
    #[serde(default = "default_priority")]
    pub default_priority: u16,
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_allow_empty_script() -> bool {
    true
}

fn default_priority() -> u16 {
    DEFAULT_PRIORITY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_grouping: TaskGrouping::default(),
            max_conflict_retries: default_max_conflict_retries(),
            allow_empty_script: default_allow_empty_script(),
            default_priority: default_priority(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.task_grouping, TaskGrouping::WholeScript);
        assert_eq!(config.max_conflict_retries, 5);
        assert!(config.allow_empty_script);
        assert_eq!(config.default_priority, 100);
    }

    #[test]
    fn test_deserialize_partial() {
        let toml = r#"
            task_grouping = "per_processor"
            default_priority = 10
        "#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.task_grouping, TaskGrouping::PerProcessor);
        assert_eq!(config.default_priority, 10);
        assert_eq!(config.max_conflict_retries, 5);
    }
}
