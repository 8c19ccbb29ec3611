// In-process task registry
//
// Volatile and single-process. Handlers are stored by reference, so Direct
// closures survive for the lifetime of the registry.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{check_edge, TaskFilter, TaskRegistry, TaskUpdate};
use crate::errors::{SchedulerError, SchedulerResult};
use crate::scheduling::task::{new_task_id, Task, TaskHandler, TaskOutcome, TaskStatus};

struct Entry {
    /// Insertion sequence; gives `find_tasks` its creation order
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    tasks: HashMap<String, Entry>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskRegistry for MemoryRegistry {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_task(&self, mut task: Task) -> SchedulerResult<Task> {
        task.validate()?;
        if task.id.is_empty() {
            task.id = new_task_id();
        }
        let now = Utc::now();
        task.created_at = now;
        task.updated_at = now;

        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(SchedulerError::conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            task.id.clone(),
            Entry {
                seq,
                task: task.clone(),
            },
        );
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.state.read().await.tasks.get(id).map(|e| e.task.clone()))
    }

    async fn find_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut entries: Vec<&Entry> = state
            .tasks
            .values()
            .filter(|e| filter.matches(&e.task))
            .collect();
        entries.sort_by_key(|e| e.seq);

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.task.clone())
            .collect())
    }

    async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> SchedulerResult<bool> {
        check_edge(from, to)?;
        let mut state = self.state.write().await;
        let entry = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if entry.task.status != from {
            return Ok(false);
        }
        entry.task.apply_transition(to, outcome, Utc::now());
        Ok(true)
    }

    async fn update_task(&self, id: &str, update: TaskUpdate) -> SchedulerResult<Task> {
        update.validate()?;
        let mut state = self.state.write().await;
        let entry = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if entry.task.status != TaskStatus::Pending {
            return Err(SchedulerError::conflict(format!(
                "task {} is {}; only pending tasks can be updated",
                id, entry.task.status
            )));
        }
        update.apply(&mut entry.task, Utc::now());
        Ok(entry.task.clone())
    }

    async fn delete_task(&self, id: &str) -> SchedulerResult<bool> {
        Ok(self.state.write().await.tasks.remove(id).is_some())
    }

    async fn reset(&self) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        state.tasks.clear();
        state.next_seq = 0;
        Ok(())
    }

    async fn attach_handler(&self, id: &str, handler: TaskHandler) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        let entry = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        entry.task.handler = Some(handler);
        Ok(())
    }
}
