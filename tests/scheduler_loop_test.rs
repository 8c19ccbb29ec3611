// Integration tests for the autonomous poll loop
//
// Drives a real TaskManager (memory backend) through start/stop and checks
// the scheduling guarantees: due tasks get picked up, priority wins a
// single slot, the concurrency cap holds, and backend errors don't kill
// the loop.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskloop::config::SchedulerConfig;
use taskloop::errors::{SchedulerError, SchedulerResult};
use taskloop::scheduling::{
    ActionRegistry, MemoryRegistry, NewTask, Task, TaskFilter, TaskHandler, TaskManager,
    TaskOutcome, TaskRegistry, TaskStatus, TaskUpdate,
};

fn config(interval_ms: u64, max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        scheduling_interval_ms: interval_ms,
        max_concurrent_tasks: max_concurrent,
        ..Default::default()
    }
}

fn memory_manager(config: SchedulerConfig) -> TaskManager {
    TaskManager::new(
        config,
        Arc::new(MemoryRegistry::new()),
        ActionRegistry::with_builtins(),
    )
}

fn past_due(name: &str, priority: u8) -> NewTask {
    NewTask::new(name)
        .at(Utc::now() - ChronoDuration::seconds(1))
        .with_priority(priority)
}

async fn wait_until_settled(manager: &TaskManager, ids: &[String], limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
        let tasks = manager
            .find_tasks(&TaskFilter::with_ids(ids.iter().cloned()))
            .await
            .unwrap();
        if tasks.iter().all(|t| t.status.is_terminal()) {
            return;
        }
        assert!(Instant::now() < deadline, "tasks did not settle in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Pickup ───────────────────────────────────────────────────────────────────

/// A past-due task goes Pending -> Running -> Completed shortly after start.
#[tokio::test]
async fn test_due_task_completes_after_start() {
    let manager = memory_manager(config(50, 3));
    let task = manager
        .create_task(past_due("p8", 8).with_action("log"))
        .await
        .unwrap();

    let started = Instant::now();
    manager.start_scheduler().await.unwrap();
    wait_until_settled(&manager, &[task.id.clone()], Duration::from_secs(2)).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let done = manager.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.attempts, 1);

    let status = manager.get_status().await;
    assert!(status.ticks >= 1);
    assert!(status.last_poll_at.is_some());
    assert_eq!(status.completed, 1);
    manager.stop_scheduler().await;
}

/// Equal priorities launch by due time, then creation order.
#[tokio::test]
async fn test_tie_break_order_with_single_slot() {
    let manager = memory_manager(config(1000, 1));
    let now = Utc::now();
    let older_due = manager
        .create_task(
            NewTask::new("older_due")
                .at(now - ChronoDuration::seconds(30))
                .with_action("log"),
        )
        .await
        .unwrap();
    let first_created = manager
        .create_task(
            NewTask::new("first_created")
                .at(now - ChronoDuration::seconds(10))
                .with_action("log"),
        )
        .await
        .unwrap();
    let second_created = manager
        .create_task(
            NewTask::new("second_created")
                .at(now - ChronoDuration::seconds(10))
                .with_action("log"),
        )
        .await
        .unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let report = manager.run_tick().await.unwrap();
        assert_eq!(report.launched.len(), 1);
        order.push(report.launched[0].clone());
        wait_until_settled(&manager, &order, Duration::from_secs(2)).await;
        // Slot is released right after the outcome is written
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(order, [older_due.id, first_created.id, second_created.id]);
}

// ── Concurrency bound ────────────────────────────────────────────────────────

/// Neither the loop nor on-demand execution pushes RUNNING past the cap.
#[tokio::test]
async fn test_running_count_never_exceeds_cap() {
    const MAX: usize = 2;
    let manager = memory_manager(config(5, MAX));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        TaskHandler::direct(move |_t: Task| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(Value::Null)
            }
        })
    };

    let mut ids = Vec::new();
    for i in 0..10u8 {
        let task = manager
            .create_task(past_due(&format!("job{}", i), 1 + i % 10).with_handler(handler.clone()))
            .await
            .unwrap();
        ids.push(task.id);
    }

    let sampler = {
        let registry = manager.registry();
        tokio::spawn(async move {
            let mut worst = 0;
            for _ in 0..100 {
                let running = registry
                    .find_tasks(&TaskFilter::with_status(TaskStatus::Running))
                    .await
                    .unwrap()
                    .len();
                worst = worst.max(running);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            worst
        })
    };

    manager.start_scheduler().await.unwrap();
    // Compete with the loop for the same slots
    let on_demand: Vec<_> = ids[..3]
        .iter()
        .map(|id| {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.execute_task_now(&id).await })
        })
        .collect();
    for handle in on_demand {
        match handle.await.unwrap() {
            Ok(result) => assert!(result.successful),
            Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
        }
    }

    wait_until_settled(&manager, &ids, Duration::from_secs(5)).await;
    manager.stop_scheduler().await;

    assert!(peak.load(Ordering::SeqCst) <= MAX);
    assert!(sampler.await.unwrap() <= MAX);
    assert_eq!(manager.get_status().await.completed, 10);
}

// ── Resilience ───────────────────────────────────────────────────────────────

/// Memory registry whose reads can be switched off
struct FlakyRegistry {
    inner: MemoryRegistry,
    broken: AtomicBool,
}

impl FlakyRegistry {
    fn check(&self) -> SchedulerResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            Err(SchedulerError::backend("database unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskRegistry for FlakyRegistry {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn create_task(&self, task: Task) -> SchedulerResult<Task> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn find_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.check()?;
        self.inner.find_tasks(filter).await
    }

    async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> SchedulerResult<bool> {
        self.inner.transition(id, from, to, outcome).await
    }

    async fn update_task(&self, id: &str, update: TaskUpdate) -> SchedulerResult<Task> {
        self.inner.update_task(id, update).await
    }

    async fn delete_task(&self, id: &str) -> SchedulerResult<bool> {
        self.inner.delete_task(id).await
    }

    async fn reset(&self) -> SchedulerResult<()> {
        self.inner.reset().await
    }

    async fn attach_handler(&self, id: &str, handler: TaskHandler) -> SchedulerResult<()> {
        self.inner.attach_handler(id, handler).await
    }
}

/// Backend errors are recorded and the loop keeps ticking.
#[tokio::test]
async fn test_backend_error_does_not_stop_loop() {
    let registry = Arc::new(FlakyRegistry {
        inner: MemoryRegistry::new(),
        broken: AtomicBool::new(true),
    });
    let manager = TaskManager::new(
        config(10, 1),
        Arc::clone(&registry) as Arc<dyn TaskRegistry>,
        ActionRegistry::with_builtins(),
    );
    let task = manager
        .create_task(past_due("after_outage", 5).with_action("log"))
        .await
        .unwrap();

    manager.start_scheduler().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = manager.get_status().await;
    assert!(status.running);
    assert!(status
        .last_tick_error
        .as_deref()
        .unwrap_or_default()
        .contains("database unavailable"));
    assert_eq!(
        manager.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    registry.broken.store(false, Ordering::SeqCst);
    wait_until_settled(&manager, &[task.id.clone()], Duration::from_secs(2)).await;
    assert!(manager.stop_scheduler().await);
}

/// A throwing handler fails its task; later tasks still run.
#[tokio::test]
async fn test_failing_handler_under_loop() {
    let manager = memory_manager(config(10, 1));
    let bad = manager
        .create_task(past_due("bad", 10).with_handler(TaskHandler::direct(|_t| async {
            Err::<Value, _>(anyhow!("upstream returned 503"))
        })))
        .await
        .unwrap();
    let good = manager
        .create_task(past_due("good", 1).with_action("log").with_param("message", "still alive"))
        .await
        .unwrap();

    manager.start_scheduler().await.unwrap();
    wait_until_settled(&manager, &[bad.id.clone(), good.id.clone()], Duration::from_secs(2))
        .await;
    manager.stop_scheduler().await;

    let bad = manager.get_task(&bad.id).await.unwrap().unwrap();
    assert_eq!(bad.status, TaskStatus::Failed);
    assert_eq!(bad.last_error.as_deref(), Some("upstream returned 503"));

    let good = manager.get_task(&good.id).await.unwrap().unwrap();
    assert_eq!(good.status, TaskStatus::Completed);
    assert_eq!(good.result, Some(json!({ "logged": "still alive" })));
}

/// Tasks created while stopped wait; nothing runs until the loop starts.
#[tokio::test]
async fn test_stopped_scheduler_runs_nothing() {
    let manager = memory_manager(config(10, 1));
    manager.start_scheduler().await.unwrap();
    manager.stop_scheduler().await;

    let task = manager
        .create_task(past_due("idle", 5).with_action("log"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        manager.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}
