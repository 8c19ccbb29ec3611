// taskloop - autonomous task scheduler
// Library exports

pub mod config;
pub mod errors;
pub mod scheduling;

pub use config::{load_config, SchedulerConfig};
pub use errors::{SchedulerError, SchedulerResult};
pub use scheduling::{
    create_manager, ActionRegistry, ExecutionResult, NewTask, Task, TaskHandler, TaskManager,
    TaskStatus,
};
