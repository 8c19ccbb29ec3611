// Scheduler error taxonomy
//
// Library operations return `SchedulerResult<T>`; application code (config
// loading, CLI) wraps these in anyhow with context.

use thiserror::Error;

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed task at creation or update; nothing was written.
    #[error("invalid task: {0}")]
    Validation(String),

    /// Duplicate id, or a status compare-and-set that lost its race.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("task not found: {0}")]
    NotFound(String),

    /// A handler raised or returned failure. Runs record this on the task;
    /// `ExecutionResult::into_result` surfaces it to callers.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The persistence layer is unreachable or returned malformed data.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("scheduler is disabled in configuration")]
    Disabled,
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// True for errors a caller should read as "no-op" rather than failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Backend(format!("malformed stored data: {}", e))
    }
}
