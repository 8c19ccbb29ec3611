// Manager factory
//
// Builds a not-yet-started TaskManager from configuration

use std::sync::Arc;

use super::actions::ActionRegistry;
use super::manager::TaskManager;
use super::registry::{MemoryRegistry, SqliteRegistry, TaskRegistry};
use crate::config::{RegistryConfig, SchedulerConfig};
use crate::errors::SchedulerResult;

/// Open the registry backend named by `config`.
pub fn create_registry(config: &RegistryConfig) -> SchedulerResult<Arc<dyn TaskRegistry>> {
    match config {
        RegistryConfig::Memory => Ok(Arc::new(MemoryRegistry::new())),
        RegistryConfig::Sqlite { path } => Ok(Arc::new(SqliteRegistry::open(path)?)),
    }
}

/// Validate `config`, open its registry and wire a manager around it.
/// The poll loop is not started.
pub fn create_manager(
    config: SchedulerConfig,
    actions: ActionRegistry,
) -> SchedulerResult<TaskManager> {
    config.validate()?;
    let registry = create_registry(&config.registry)?;
    tracing::debug!(backend = registry.backend_name(), "Created task registry");
    Ok(TaskManager::new(config, registry, actions))
}
