// Task model and lifecycle state machine

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{SchedulerError, SchedulerResult};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Key in `parameters` naming a registered action for declarative tasks
pub const ACTION_PARAM: &str = "action";

/// Task status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Edges of the lifecycle graph.
    ///
    /// Running -> Pending exists only for configured retries and orphan
    /// requeue; Pending -> Failed only for cancellation.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Pending, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(SchedulerError::validation(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

/// How the task's due time is determined
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fixed `scheduled_time`
    #[default]
    Explicit,
    /// Recurring; each completion schedules the next occurrence
    Interval { every_ms: u64 },
    /// Natural-language urgency term, resolved once at creation
    Vague { term: String },
}

impl ScheduleType {
    pub fn label(&self) -> &'static str {
        match self {
            ScheduleType::Explicit => "explicit",
            ScheduleType::Interval { .. } => "interval",
            ScheduleType::Vague { .. } => "vague",
        }
    }
}

/// Unit of work invoked when a task executes.
///
/// The returned value is recorded as the task's `result`; an error moves the
/// task to Failed with the error text captured.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, task: &Task) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, task: &Task) -> anyhow::Result<Value> {
        (self.0)(task.clone()).await
    }
}

/// A task's handler: an in-process callable, or a reference to a named
/// action resolved through the action registry.
#[derive(Clone)]
pub enum TaskHandler {
    Direct(Arc<dyn Handler>),
    Named { action: String },
}

impl TaskHandler {
    pub fn direct<F, Fut>(f: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        TaskHandler::Direct(Arc::new(FnHandler(f)))
    }

    pub fn named(action: impl Into<String>) -> Self {
        TaskHandler::Named {
            action: action.into(),
        }
    }

    pub fn action_name(&self) -> Option<&str> {
        match self {
            TaskHandler::Named { action } => Some(action),
            TaskHandler::Direct(_) => None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, TaskHandler::Direct(_))
    }
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskHandler::Direct(_) => f.write_str("Direct(<handler>)"),
            TaskHandler::Named { action } => write!(f, "Named({})", action),
        }
    }
}

fn serialize_handler<S: Serializer>(
    handler: &Option<TaskHandler>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    enum Descriptor<'a> {
        Direct,
        Named { action: &'a str },
    }

    match handler {
        None => serializer.serialize_none(),
        Some(TaskHandler::Direct(_)) => Descriptor::Direct.serialize(serializer),
        Some(TaskHandler::Named { action }) => Descriptor::Named { action }.serialize(serializer),
    }
}

/// A scheduled task
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub schedule: ScheduleType,
    pub priority: u8,
    pub status: TaskStatus,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_handler")]
    pub handler: Option<TaskHandler>,
    pub parameters: Map<String, Value>,
    /// Number of times execution was started
    pub attempts: u32,
    pub result: Option<Value>,
    pub last_error: Option<String>,
}

impl Task {
    /// Validate the fields the registry requires before persisting.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::validation("name must not be empty"));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(SchedulerError::validation(format!(
                "priority {} outside {}..={}",
                self.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        match &self.schedule {
            ScheduleType::Explicit | ScheduleType::Vague { .. } if self.scheduled_time.is_none() => {
                return Err(SchedulerError::validation(format!(
                    "{} schedule requires a scheduled time",
                    self.schedule.label()
                )));
            }
            ScheduleType::Interval { every_ms: 0 } => {
                return Err(SchedulerError::validation("interval must be greater than zero"));
            }
            ScheduleType::Vague { term } if term.trim().is_empty() => {
                return Err(SchedulerError::validation("vague term must not be empty"));
            }
            _ => {}
        }
        match &self.handler {
            None => Err(SchedulerError::validation(
                "task needs a handler or a parameters.action",
            )),
            Some(TaskHandler::Named { action }) if action.trim().is_empty() => {
                Err(SchedulerError::validation("action name must not be empty"))
            }
            Some(_) => Ok(()),
        }
    }

    /// Due iff Pending and the scheduled time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_time.map(|t| t <= now).unwrap_or(false)
    }

    /// Apply a status change plus its run outcome. Callers check the
    /// compare-and-set precondition first.
    pub fn apply_transition(&mut self, to: TaskStatus, outcome: Option<TaskOutcome>, now: DateTime<Utc>) {
        if to == TaskStatus::Running {
            self.attempts += 1;
        }
        self.status = to;
        self.updated_at = now;
        if let Some(outcome) = outcome {
            outcome.apply(self);
        }
    }

    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// What a settled (or requeued) execution writes alongside its transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    pub result: Option<Value>,
    pub error: Option<String>,
    /// New due time, used when a run is requeued
    pub reschedule_at: Option<DateTime<Utc>>,
}

impl TaskOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn requeue(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error: Some(error.into()),
            reschedule_at: Some(at),
            ..Default::default()
        }
    }

    fn apply(self, task: &mut Task) {
        if self.result.is_some() {
            task.result = self.result;
            task.last_error = None;
        }
        if self.error.is_some() {
            task.last_error = self.error;
        }
        if self.reschedule_at.is_some() {
            task.scheduled_time = self.reschedule_at;
        }
    }
}

/// Caller-side description of a task to create
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub schedule: ScheduleType,
    pub priority: Option<u8>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub handler: Option<TaskHandler>,
    pub parameters: Map<String, Value>,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.schedule = ScheduleType::Explicit;
        self.scheduled_time = Some(when);
        self
    }

    pub fn every_ms(mut self, every_ms: u64) -> Self {
        self.schedule = ScheduleType::Interval { every_ms };
        self
    }

    pub fn vague(mut self, term: impl Into<String>) -> Self {
        self.schedule = ScheduleType::Vague { term: term.into() };
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_handler(mut self, handler: TaskHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.parameters
            .insert(ACTION_PARAM.to_string(), Value::String(action.into()));
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Build the Pending task. A missing literal handler falls back to
    /// `parameters.action`; an empty id is left for the registry to assign.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        let handler = self.handler.or_else(|| {
            self.parameters
                .get(ACTION_PARAM)
                .and_then(|v| v.as_str())
                .map(TaskHandler::named)
        });
        Task {
            id: self.id.unwrap_or_default(),
            name: self.name,
            description: self.description,
            schedule: self.schedule,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            status: TaskStatus::Pending,
            scheduled_time: self.scheduled_time,
            created_at: now,
            updated_at: now,
            handler,
            parameters: self.parameters,
            attempts: 0,
            result: None,
            last_error: None,
        }
    }
}

/// Fresh time-ordered id (UUID v7, lexicographically sortable as text)
pub fn new_task_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
