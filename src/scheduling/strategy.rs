// Due-task selection policy
//
// Pure: given a snapshot and an instant, returns the due tasks in execution
// order. No I/O, no mutation.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use super::task::Task;

pub trait SchedulingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Due tasks from `tasks`, ordered for execution
    fn select_due_tasks(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<Task>;
}

/// Highest priority first; then earliest due time; then oldest.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityStrategy;

impl PriorityStrategy {
    pub fn compare(a: &Task, b: &Task) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.scheduled_time.cmp(&b.scheduled_time))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

impl SchedulingStrategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select_due_tasks(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<Task> {
        let mut due: Vec<Task> = tasks.iter().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by(Self::compare);
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::task::{NewTask, TaskStatus};
    use chrono::Duration;

    fn task(id: &str, priority: u8, due_offset_secs: i64, created_offset_secs: i64) -> Task {
        let base = Utc::now();
        let mut t = NewTask::new(id)
            .with_id(id)
            .at(base + Duration::seconds(due_offset_secs))
            .with_priority(priority)
            .with_action("log")
            .into_task(base);
        t.created_at = base + Duration::seconds(created_offset_secs);
        t
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn test_only_due_pending_tasks_selected() {
        let now = Utc::now() + Duration::seconds(1);
        let mut running = task("running", 9, -10, 0);
        running.status = TaskStatus::Running;
        let tasks = vec![
            task("due", 5, -10, 0),
            task("future", 5, 3600, 0),
            running,
        ];
        let selected = PriorityStrategy.select_due_tasks(&tasks, now);
        assert_eq!(ids(&selected), ["due"]);
    }

    #[test]
    fn test_priority_descending() {
        let now = Utc::now() + Duration::seconds(1);
        let tasks = vec![task("p3", 3, -5, 0), task("p10", 10, -5, 0), task("p7", 7, -5, 0)];
        let selected = PriorityStrategy.select_due_tasks(&tasks, now);
        assert_eq!(ids(&selected), ["p10", "p7", "p3"]);
    }

    #[test]
    fn test_tie_break_scheduled_time_then_created_at() {
        let now = Utc::now() + Duration::seconds(1);
        let tasks = vec![
            task("later_due", 5, -5, 0),
            task("young", 5, -10, 2),
            task("old", 5, -10, 1),
        ];
        let selected = PriorityStrategy.select_due_tasks(&tasks, now);
        assert_eq!(ids(&selected), ["old", "young", "later_due"]);
    }

    #[test]
    fn test_task_without_time_is_never_due() {
        let mut t = task("untimed", 10, -5, 0);
        t.scheduled_time = None;
        assert!(PriorityStrategy
            .select_due_tasks(&[t], Utc::now())
            .is_empty());
    }

    #[test]
    fn test_input_not_mutated() {
        let now = Utc::now() + Duration::seconds(1);
        let tasks = vec![task("a", 1, -5, 0), task("b", 9, -5, 0)];
        let _ = PriorityStrategy.select_due_tasks(&tasks, now);
        assert_eq!(ids(&tasks), ["a", "b"]);
    }
}
