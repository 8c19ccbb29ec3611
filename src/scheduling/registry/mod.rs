// Task registry: storage contract for tasks
//
// Backends are interchangeable: the in-process map (fast, volatile) and the
// SQLite store (durable across restarts). Both must implement `transition`
// as an atomic compare-and-set on status; that is the only primitive that
// keeps a task from being executed twice.

mod memory;
mod sqlite;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::task::{Task, TaskHandler, TaskOutcome, TaskStatus, MAX_PRIORITY, MIN_PRIORITY};
use crate::errors::{SchedulerError, SchedulerResult};

/// Query filter; the default (empty) filter matches every task
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub ids: Option<Vec<String>>,
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        match &self.ids {
            Some(ids) => ids.iter().any(|id| id == &task.id),
            None => true,
        }
    }
}

/// Caller-editable fields; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub parameters: Option<Map<String, Value>>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.scheduled_time.is_none()
            && self.parameters.is_none()
    }

    fn validate(&self) -> SchedulerResult<()> {
        if self.is_empty() {
            return Err(SchedulerError::validation("update changes nothing"));
        }
        if let Some(p) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&p) {
                return Err(SchedulerError::validation(format!(
                    "priority {} outside {}..={}",
                    p, MIN_PRIORITY, MAX_PRIORITY
                )));
            }
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(SchedulerError::validation("name must not be empty"));
            }
        }
        Ok(())
    }

    /// Apply to a task already known to be Pending.
    fn apply(self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            task.name = name;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(at) = self.scheduled_time {
            task.scheduled_time = Some(at);
        }
        if let Some(parameters) = self.parameters {
            task.parameters = parameters;
        }
        task.updated_at = now;
    }
}

/// Storage and query of tasks, independent of scheduling policy
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Short backend name for logs and status output
    fn backend_name(&self) -> &'static str;

    /// Persist a new task. Assigns an id when empty and stamps
    /// `created_at`/`updated_at`. Rejects invalid tasks and duplicate ids.
    async fn create_task(&self, task: Task) -> SchedulerResult<Task>;

    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>>;

    /// Tasks matching `filter`, in creation order.
    async fn find_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    /// Compare-and-set the status, writing `outcome` with it. Returns false
    /// without mutating when the current status is not `from`.
    async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> SchedulerResult<bool>;

    /// Plain status compare-and-set
    async fn update_task_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> SchedulerResult<bool> {
        self.transition(id, from, to, None).await
    }

    /// Edit caller-owned fields of a Pending task.
    async fn update_task(&self, id: &str, update: TaskUpdate) -> SchedulerResult<Task>;

    async fn delete_task(&self, id: &str) -> SchedulerResult<bool>;

    /// Remove every task.
    async fn reset(&self) -> SchedulerResult<()>;

    /// Bind an in-process handler to a stored task.
    async fn attach_handler(&self, id: &str, handler: TaskHandler) -> SchedulerResult<()>;
}

/// Shared edge check used by the backends before applying a CAS.
pub(crate) fn check_edge(from: TaskStatus, to: TaskStatus) -> SchedulerResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(SchedulerError::validation(format!(
            "illegal status transition {} -> {}",
            from, to
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::task::NewTask;

    #[test]
    fn test_empty_filter_matches_everything() {
        let task = NewTask::new("t").at(Utc::now()).with_action("log").into_task(Utc::now());
        assert!(TaskFilter::default().matches(&task));
    }

    #[test]
    fn test_filter_by_status_and_ids() {
        let mut task = NewTask::new("t").at(Utc::now()).with_action("log").into_task(Utc::now());
        task.id = "a".into();
        assert!(TaskFilter::with_status(TaskStatus::Pending).matches(&task));
        assert!(!TaskFilter::with_status(TaskStatus::Running).matches(&task));
        assert!(TaskFilter::with_ids(["a", "b"]).matches(&task));
        assert!(!TaskFilter::with_ids(["b"]).matches(&task));
    }

    #[test]
    fn test_update_validation() {
        let bad = TaskUpdate {
            priority: Some(42),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(TaskUpdate::default().is_empty());
        assert!(matches!(
            TaskUpdate::default().validate(),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn test_check_edge() {
        assert!(check_edge(TaskStatus::Pending, TaskStatus::Running).is_ok());
        assert!(check_edge(TaskStatus::Completed, TaskStatus::Running).is_err());
    }
}
