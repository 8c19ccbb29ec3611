// Task manager
//
// Owns the poll loop and the concurrency bound. Every launch goes through a Pending -> Running compare-and-set on the
// registry; the semaphore caps how many launches are outstanding at once,
// for the poll loop and `execute_task_now` alike.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actions::ActionRegistry;
use super::registry::{TaskFilter, TaskRegistry, TaskUpdate};
use super::strategy::{PriorityStrategy, SchedulingStrategy};
use super::task::{Handler, NewTask, ScheduleType, Task, TaskHandler, TaskOutcome, TaskStatus};
use super::vague_time::{VagueTermTable, VagueTranslation};
use crate::config::{OrphanPolicy, SchedulerConfig};
use crate::errors::{SchedulerError, SchedulerResult};

const CANCELLED: &str = "cancelled";

/// Outcome of one execution, as returned to `execute_task_now` callers
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionResult {
    pub task_id: String,
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The failure was absorbed by the retry policy; the task is Pending again
    pub requeued: bool,
}

impl ExecutionResult {
    /// The handler's value, or `Execution` carrying the recorded error.
    pub fn into_result(self) -> SchedulerResult<Value> {
        if self.successful {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(SchedulerError::Execution(format!(
                "task {}: {}",
                self.task_id,
                self.error.as_deref().unwrap_or("unknown error")
            )))
        }
    }
}

/// Observability snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_executions: usize,
    pub max_concurrent_tasks: usize,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_tick_error: Option<String>,
    pub backend: &'static str,
    pub strategy: &'static str,
}

/// What one poll tick did
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TickReport {
    /// Due tasks offered by the strategy
    pub due: usize,
    /// Ids moved to Running and launched, in launch order
    pub launched: Vec<String>,
    /// Due tasks whose compare-and-set was lost
    pub skipped: usize,
}

struct PollLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TickState {
    last_poll_at: Option<DateTime<Utc>>,
    last_tick_error: Option<String>,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<dyn TaskRegistry>,
    strategy: Arc<dyn SchedulingStrategy>,
    actions: ActionRegistry,
    vague_terms: VagueTermTable,
    slots: Arc<Semaphore>,
    /// Ids this manager moved to Running and has not settled yet
    in_flight: DashSet<String>,
    poll: Mutex<Option<PollLoop>>,
    running: AtomicBool,
    tick_state: RwLock<TickState>,
    ticks: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Explicitly owned scheduler instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Manager with the default priority strategy. Not started.
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn TaskRegistry>,
        actions: ActionRegistry,
    ) -> Self {
        Self::with_strategy(config, registry, Arc::new(PriorityStrategy), actions)
    }

    pub fn with_strategy(
        mut config: SchedulerConfig,
        registry: Arc<dyn TaskRegistry>,
        strategy: Arc<dyn SchedulingStrategy>,
        actions: ActionRegistry,
    ) -> Self {
        if config.max_concurrent_tasks == 0 {
            warn!("max_concurrent_tasks is 0; running one task at a time");
            config.max_concurrent_tasks = 1;
        }
        let vague_terms = VagueTermTable::with_entries(&config.vague_terms);
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                strategy,
                actions,
                vague_terms,
                slots,
                in_flight: DashSet::new(),
                poll: Mutex::new(None),
                running: AtomicBool::new(false),
                tick_state: RwLock::new(TickState::default()),
                ticks: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> Arc<dyn TaskRegistry> {
        Arc::clone(&self.inner.registry)
    }

    // ── Task CRUD ──────────────────────────────────────────────────────────

    /// Validate and store a new Pending task. Never executes it.
    pub async fn create_task(&self, new: NewTask) -> SchedulerResult<Task> {
        let now = Utc::now();
        let new = self.inner.resolve_schedule(new, now);
        let task = new.into_task(now);

        if let Some(TaskHandler::Named { action }) = &task.handler {
            if !self.inner.actions.contains(action) {
                return Err(SchedulerError::validation(format!(
                    "unknown action '{}' (registered: {})",
                    action,
                    self.inner.actions.names().join(", ")
                )));
            }
        }

        let stored = self.inner.registry.create_task(task).await?;
        info!(
            task_id = %stored.id,
            priority = stored.priority,
            schedule = stored.schedule.label(),
            "Created task '{}'",
            stored.name
        );
        Ok(stored)
    }

    pub async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        self.inner.registry.get_task(id).await
    }

    pub async fn find_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.inner.registry.find_tasks(filter).await
    }

    pub async fn delete_task(&self, id: &str) -> SchedulerResult<bool> {
        self.inner.registry.delete_task(id).await
    }

    /// Edit a Pending task's caller-owned fields.
    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> SchedulerResult<Task> {
        self.inner.registry.update_task(id, update).await
    }

    /// Pending -> Failed with error "cancelled".
    pub async fn cancel_task(&self, id: &str) -> SchedulerResult<()> {
        let cancelled = self
            .inner
            .registry
            .transition(
                id,
                TaskStatus::Pending,
                TaskStatus::Failed,
                Some(TaskOutcome::failure(CANCELLED)),
            )
            .await?;
        if !cancelled {
            return Err(SchedulerError::conflict(format!(
                "task {} is not pending",
                id
            )));
        }
        info!(task_id = %id, "Cancelled task");
        Ok(())
    }

    /// Bind an in-process handler, e.g. after reopening a durable registry.
    pub async fn attach_handler(&self, id: &str, handler: Arc<dyn Handler>) -> SchedulerResult<()> {
        self.inner
            .registry
            .attach_handler(id, TaskHandler::Direct(handler))
            .await
    }

    /// Translate a vague term with this manager's vocabulary.
    pub fn translate(&self, term: &str, reference: DateTime<Utc>) -> Option<VagueTranslation> {
        self.inner.vague_terms.translate(term, reference)
    }

    /// Vague terms this manager understands, sorted
    pub fn known_terms(&self) -> Vec<&str> {
        self.inner.vague_terms.terms()
    }

    // ── Execution ──────────────────────────────────────────────────────────

    /// Run a Pending task now, ignoring its due time, and wait for the
    /// outcome. Waits for a free slot first; a lost compare-and-set is a
    /// `Conflict` and nothing runs. Once claimed, the run settles in the
    /// background even if the caller stops waiting.
    pub async fn execute_task_now(&self, id: &str) -> SchedulerResult<ExecutionResult> {
        if !self.inner.config.enabled {
            return Err(SchedulerError::Disabled);
        }

        let task = self
            .inner
            .registry
            .get_task(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(SchedulerError::conflict(format!(
                "task {} is {}",
                id, task.status
            )));
        }

        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::backend("execution slots closed"))?;

        let inner = Arc::clone(&self.inner);
        let run = tokio::spawn(async move {
            match inner.claim(&task.id).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(SchedulerError::conflict(format!(
                        "task {} was claimed by another execution",
                        task.id
                    )))
                }
                Err(e) => return Err(e),
            }
            debug!(task_id = %task.id, "Executing task on demand");
            Ok(inner.execute(task, permit).await)
        });

        run.await
            .map_err(|e| SchedulerError::backend(format!("execution of {} aborted: {}", id, e)))?
    }

    /// One poll tick: select due tasks and launch as many as there are free
    /// slots. Launched executions run in the background.
    pub async fn run_tick(&self) -> SchedulerResult<TickReport> {
        if !self.inner.config.enabled {
            return Err(SchedulerError::Disabled);
        }
        self.inner.tick().await
    }

    /// Apply the orphan policy to Running tasks this manager did not launch.
    /// Returns how many were moved.
    pub async fn recover_orphans(&self) -> SchedulerResult<usize> {
        self.inner.recover_orphans().await
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Start the poll loop. Returns false when it was already running or is
    /// switched off in configuration.
    pub async fn start_scheduler(&self) -> SchedulerResult<bool> {
        let config = &self.inner.config;
        if !config.enabled {
            warn!("Scheduler is disabled in configuration; not starting");
            return Ok(false);
        }
        if !config.enable_auto_scheduling {
            info!("Auto scheduling is off; tasks run only on demand");
            return Ok(false);
        }

        let mut poll = self.inner.poll.lock().await;
        if poll.is_some() {
            debug!("Scheduler already running");
            return Ok(false);
        }

        if config.orphan_policy != OrphanPolicy::Leave {
            if let Err(e) = self.inner.recover_orphans().await {
                warn!("Orphan recovery failed: {}", e);
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            Duration::from_millis(config.scheduling_interval_ms.max(1)),
        ));
        *poll = Some(PollLoop { cancel, handle });
        self.inner.running.store(true, Ordering::SeqCst);

        info!(
            interval_ms = config.scheduling_interval_ms,
            max_concurrent = config.max_concurrent_tasks,
            backend = self.inner.registry.backend_name(),
            "Scheduler started"
        );
        Ok(true)
    }

    /// Stop picking up due tasks. Returns once the loop has exited; in-flight
    /// executions keep running to completion.
    pub async fn stop_scheduler(&self) -> bool {
        let poll = self.inner.poll.lock().await.take();
        let Some(poll) = poll else {
            return false;
        };

        poll.cancel.cancel();
        if let Err(e) = poll.handle.await {
            error!("Scheduler loop ended abnormally: {}", e);
        }
        self.inner.running.store(false, Ordering::SeqCst);
        info!(
            in_flight = self.inner.in_flight.len(),
            "Scheduler stopped"
        );
        true
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let tick_state = self.inner.tick_state.read().await;
        SchedulerStatus {
            running: self.is_scheduler_running(),
            active_executions: self.inner.in_flight.len(),
            max_concurrent_tasks: self.inner.config.max_concurrent_tasks,
            last_poll_at: tick_state.last_poll_at,
            ticks: self.inner.ticks.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            last_tick_error: tick_state.last_tick_error.clone(),
            backend: self.inner.registry.backend_name(),
            strategy: self.inner.strategy.name(),
        }
    }

    /// Stop the loop and clear the registry.
    pub async fn reset(&self) -> SchedulerResult<()> {
        self.stop_scheduler().await;
        self.inner.registry.reset().await?;
        self.inner.ticks.store(0, Ordering::Relaxed);
        self.inner.completed.store(0, Ordering::Relaxed);
        self.inner.failed.store(0, Ordering::Relaxed);
        *self.inner.tick_state.write().await = TickState::default();
        info!("Scheduler reset");
        Ok(())
    }
}

async fn poll_loop(inner: Weak<Inner>, cancel: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match inner.tick().await {
            Ok(report) if !report.launched.is_empty() => {
                debug!(
                    due = report.due,
                    launched = report.launched.len(),
                    skipped = report.skipped,
                    "Tick launched tasks"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Scheduler tick failed: {}", e);
                inner.tick_state.write().await.last_tick_error = Some(e.to_string());
            }
        }
    }

    debug!("Scheduler loop exited");
}

impl Inner {
    /// Fill in due time and priority from the schedule type.
    fn resolve_schedule(&self, mut new: NewTask, now: DateTime<Utc>) -> NewTask {
        match &new.schedule {
            ScheduleType::Vague { term } => match self.vague_terms.translate(term, now) {
                Some(translation) => {
                    new.scheduled_time.get_or_insert(translation.date);
                    new.priority.get_or_insert(translation.priority);
                }
                None => {
                    debug!("No translation for vague term '{}', due now", term);
                    new.scheduled_time.get_or_insert(now);
                }
            },
            ScheduleType::Interval { .. } => {
                new.scheduled_time.get_or_insert(now);
            }
            ScheduleType::Explicit => {}
        }
        new
    }

    /// Pending -> Running. Registers the id as in flight on success.
    async fn claim(&self, id: &str) -> SchedulerResult<bool> {
        let claimed = self
            .registry
            .update_task_status(id, TaskStatus::Pending, TaskStatus::Running)
            .await?;
        if claimed {
            self.in_flight.insert(id.to_string());
        }
        Ok(claimed)
    }

    async fn tick(self: &Arc<Self>) -> SchedulerResult<TickReport> {
        let now = Utc::now();
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.tick_state.write().await.last_poll_at = Some(now);

        let pending = self
            .registry
            .find_tasks(&TaskFilter::with_status(TaskStatus::Pending))
            .await?;
        let due = self.strategy.select_due_tasks(&pending, now);

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        let available = self.slots.available_permits();

        for task in due.into_iter().take(available) {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                break;
            };
            match self.claim(&task.id).await {
                Ok(true) => {
                    report.launched.push(task.id.clone());
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        inner.execute(task, permit).await;
                    });
                }
                Ok(false) | Err(SchedulerError::NotFound(_)) => {
                    debug!(task_id = %task.id, "Lost claim, skipping this tick");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Run a claimed task's handler and settle it. The slot is released
    /// only after the outcome is written.
    async fn execute(self: Arc<Self>, task: Task, permit: OwnedSemaphorePermit) -> ExecutionResult {
        let started = Utc::now();
        let task = self.claimed_copy(task, started).await;

        let outcome = self.run_handler(&task).await;
        let now = Utc::now();

        let (to, settled) = match outcome {
            Ok(value) => (TaskStatus::Completed, TaskOutcome::success(value)),
            Err(message) if self.config.retry.should_retry(task.attempts) => {
                let backoff =
                    chrono::Duration::from_std(Duration::from_millis(self.config.retry.backoff_ms))
                        .unwrap_or_else(|_| chrono::Duration::zero());
                warn!(
                    task_id = %task.id,
                    attempt = task.attempts,
                    "Task failed, requeueing: {}",
                    message
                );
                (TaskStatus::Pending, TaskOutcome::requeue(message, now + backoff))
            }
            Err(message) => (TaskStatus::Failed, TaskOutcome::failure(message)),
        };

        let result = ExecutionResult {
            task_id: task.id.clone(),
            successful: to == TaskStatus::Completed,
            error: settled.error.clone(),
            result: settled.result.clone(),
            requeued: to == TaskStatus::Pending,
        };
        match to {
            TaskStatus::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskStatus::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        match self
            .registry
            .transition(&task.id, TaskStatus::Running, to, Some(settled))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                task_id = %task.id,
                "Task left Running while executing; outcome discarded"
            ),
            Err(e) => error!(task_id = %task.id, "Failed to record outcome: {}", e),
        }
        self.in_flight.remove(&task.id);
        drop(permit);

        match to {
            TaskStatus::Completed => {
                info!(
                    task_id = %task.id,
                    elapsed_ms = (now - started).num_milliseconds(),
                    "Task '{}' completed",
                    task.name
                );
                if let ScheduleType::Interval { every_ms } = task.schedule {
                    self.schedule_next_occurrence(&task, every_ms, now).await;
                }
            }
            TaskStatus::Failed => warn!(
                task_id = %task.id,
                "Task '{}' failed: {}",
                task.name,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            _ => {}
        }

        result
    }

    /// The stored task as of its claim, so edits made while it waited for a
    /// slot are seen by the handler. Falls back to the caller's snapshot.
    async fn claimed_copy(&self, mut snapshot: Task, now: DateTime<Utc>) -> Task {
        match self.registry.get_task(&snapshot.id).await {
            Ok(Some(stored)) if stored.status == TaskStatus::Running => return stored,
            Ok(_) => debug!(task_id = %snapshot.id, "Claimed task changed underneath; using snapshot"),
            Err(e) => warn!(task_id = %snapshot.id, "Could not reload claimed task: {}", e),
        }
        snapshot.apply_transition(TaskStatus::Running, None, now);
        snapshot
    }

    /// Resolve and invoke the handler. Errors, panics and timeouts all come
    /// back as the error text recorded on the task.
    async fn run_handler(&self, task: &Task) -> Result<Value, String> {
        let handler: Arc<dyn Handler> = match &task.handler {
            Some(TaskHandler::Direct(handler)) => Arc::clone(handler),
            Some(TaskHandler::Named { action }) => self
                .actions
                .get(action)
                .ok_or_else(|| format!("unknown action '{}'", action))?,
            None => {
                return Err("no handler attached (in-process handlers must be re-attached after a restart)".to_string())
            }
        };

        let run = AssertUnwindSafe(handler.run(task)).catch_unwind();
        let joined = match self.config.task_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
                Ok(joined) => joined,
                Err(_) => return Err(format!("timed out after {}ms", ms)),
            },
            None => run.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err("handler panicked".to_string()),
        }
    }

    async fn schedule_next_occurrence(&self, task: &Task, every_ms: u64, now: DateTime<Utc>) {
        let step = match chrono::Duration::from_std(Duration::from_millis(every_ms)) {
            Ok(step) => step,
            Err(e) => {
                error!(task_id = %task.id, "Interval out of range, not rescheduling: {}", e);
                return;
            }
        };
        let previous = task.scheduled_time.unwrap_or(now);
        let next_at = if previous + step > now {
            previous + step
        } else {
            now + step
        };

        let next = NewTask {
            id: None,
            name: task.name.clone(),
            description: task.description.clone(),
            schedule: task.schedule.clone(),
            priority: Some(task.priority),
            scheduled_time: Some(next_at),
            handler: task.handler.clone(),
            parameters: task.parameters.clone(),
        };
        match self.registry.create_task(next.into_task(now)).await {
            Ok(created) => debug!(
                task_id = %created.id,
                previous = %task.id,
                "Scheduled next occurrence at {}",
                next_at
            ),
            Err(e) => error!(task_id = %task.id, "Failed to schedule next occurrence: {}", e),
        }
    }

    async fn recover_orphans(&self) -> SchedulerResult<usize> {
        let running = self
            .registry
            .find_tasks(&TaskFilter::with_status(TaskStatus::Running))
            .await?;
        let orphans: Vec<Task> = running
            .into_iter()
            .filter(|t| !self.in_flight.contains(&t.id))
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let (to, outcome) = match self.config.orphan_policy {
            OrphanPolicy::Leave => {
                warn!(
                    count = orphans.len(),
                    "Found tasks stuck in Running; leaving them (orphan_policy = leave)"
                );
                return Ok(0);
            }
            OrphanPolicy::Requeue => (
                TaskStatus::Pending,
                TaskOutcome::requeue("requeued after interrupted run", now),
            ),
            OrphanPolicy::Fail => (
                TaskStatus::Failed,
                TaskOutcome::failure("interrupted: process stopped while running"),
            ),
        };

        let mut moved = 0;
        for orphan in &orphans {
            if self
                .registry
                .transition(&orphan.id, TaskStatus::Running, to, Some(outcome.clone()))
                .await?
            {
                moved += 1;
            }
        }
        info!(moved, policy = ?self.config.orphan_policy, "Recovered orphaned tasks");
        Ok(moved)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(poll) = self.poll.get_mut().take() {
            poll.cancel.cancel();
        }
    }
}
