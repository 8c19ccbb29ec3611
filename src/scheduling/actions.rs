// Named actions for declarative tasks
//
// A task created with `parameters.action = "<name>"` (no literal handler) is
// dispatched through this registry at execution time. The built-ins are
// enough for the CLI; embedding applications register their own.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::task::{Handler, Task};

/// Maximum accepted duration for the built-in `sleep` action
const MAX_SLEEP_MS: u64 = 10 * 60 * 1000;

/// Registry of named operations
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Handler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `log`, `sleep` and `fail`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", LogAction);
        registry.register("sleep", SleepAction);
        registry.register("fail", FailAction);
        registry
    }

    /// Register (or replace) an action
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.actions.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Logs `parameters.message` (or the task name)
pub struct LogAction;

#[async_trait]
impl Handler for LogAction {
    async fn run(&self, task: &Task) -> Result<Value> {
        let message = task.param_str("message").unwrap_or(&task.name);
        tracing::info!(task_id = %task.id, "{}", message);
        Ok(json!({ "logged": message }))
    }
}

/// Sleeps for `parameters.ms` milliseconds
pub struct SleepAction;

#[async_trait]
impl Handler for SleepAction {
    async fn run(&self, task: &Task) -> Result<Value> {
        let Some(ms) = task.parameters.get("ms").and_then(Value::as_u64) else {
            bail!("sleep action needs an integer 'ms' parameter");
        };
        if ms > MAX_SLEEP_MS {
            bail!("sleep of {}ms exceeds the {}ms limit", ms, MAX_SLEEP_MS);
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Always fails with `parameters.message`
pub struct FailAction;

#[async_trait]
impl Handler for FailAction {
    async fn run(&self, task: &Task) -> Result<Value> {
        bail!("{}", task.param_str("message").unwrap_or("requested failure"))
    }
}
