// Configuration structures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::scheduling::vague_time::VagueTermEntry;

pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Scheduler configuration (`config.toml`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Master switch; when false the loop never starts and manual execution
    /// is refused
    pub enabled: bool,

    /// Start the poll loop when asked; manual execution works either way
    pub enable_auto_scheduling: bool,

    /// Poll period
    pub scheduling_interval_ms: u64,

    /// Hard cap on simultaneously running tasks
    pub max_concurrent_tasks: usize,

    pub registry: RegistryConfig,

    /// Per-execution timeout; none means a hung handler keeps its slot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_ms: Option<u64>,

    pub retry: RetryPolicy,

    pub orphan_policy: OrphanPolicy,

    /// Extra (or overriding) vague urgency terms
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vague_terms: Vec<VagueTermEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_auto_scheduling: true,
            scheduling_interval_ms: DEFAULT_INTERVAL_MS,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT,
            registry: RegistryConfig::Memory,
            task_timeout_ms: None,
            retry: RetryPolicy::default(),
            orphan_policy: OrphanPolicy::default(),
            vague_terms: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Same defaults backed by a SQLite file
    pub fn with_sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            registry: RegistryConfig::Sqlite { path: path.into() },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.scheduling_interval_ms == 0 {
            return Err(SchedulerError::validation(
                "scheduling_interval_ms must be greater than zero",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(SchedulerError::validation(
                "max_concurrent_tasks must be at least 1",
            ));
        }
        if self.task_timeout_ms == Some(0) {
            return Err(SchedulerError::validation(
                "task_timeout_ms must be greater than zero when set",
            ));
        }
        if let RegistryConfig::Sqlite { path } = &self.registry {
            if path.as_os_str().is_empty() {
                return Err(SchedulerError::validation("sqlite registry needs a path"));
            }
        }
        Ok(())
    }
}

/// Registry backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryConfig {
    #[default]
    Memory,
    Sqlite { path: PathBuf },
}

/// What happens to a run whose handler failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure (0 = fail immediately)
    pub max_retries: u32,
    /// Delay before a requeued task becomes due again
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Whether a run that just failed on attempt `attempt` (1-based) gets
    /// another go.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Treatment of tasks found Running that no live execution owns
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Report and leave them Running
    #[default]
    Leave,
    /// Move back to Pending, due immediately
    Requeue,
    /// Move to Failed
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.enabled);
        assert!(config.enable_auto_scheduling);
        assert_eq!(config.scheduling_interval_ms, 1000);
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.registry, RegistryConfig::Memory);
        assert_eq!(config.orphan_policy, OrphanPolicy::Leave);
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: SchedulerConfig = toml::from_str(
            r#"
            max_concurrent_tasks = 1
            orphan_policy = "requeue"

            [registry]
            type = "sqlite"
            path = "/tmp/tasks.db"

            [retry]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.scheduling_interval_ms, DEFAULT_INTERVAL_MS);
        assert_eq!(config.orphan_policy, OrphanPolicy::Requeue);
        assert_eq!(
            config.registry,
            RegistryConfig::Sqlite {
                path: PathBuf::from("/tmp/tasks.db")
            }
        );
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff_ms, 0);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = SchedulerConfig::default();
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.scheduling_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.task_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy() {
        let none = RetryPolicy::default();
        assert!(!none.should_retry(1));

        let twice = RetryPolicy {
            max_retries: 2,
            backoff_ms: 0,
        };
        assert!(twice.should_retry(1));
        assert!(twice.should_retry(2));
        assert!(!twice.should_retry(3));
    }
}
