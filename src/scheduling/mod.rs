// Autonomous task scheduling system
//
// Tasks are created with a due time (explicit, recurring or a vague urgency
// term), stored in a registry, and picked up by the manager's poll loop in
// priority order under a concurrency cap.

pub mod actions;
pub mod factory;
pub mod manager;
pub mod registry;
pub mod strategy;
pub mod task;
pub mod vague_time;

pub use actions::ActionRegistry;
pub use factory::{create_manager, create_registry};
pub use manager::{ExecutionResult, SchedulerStatus, TaskManager, TickReport};
pub use registry::{MemoryRegistry, SqliteRegistry, TaskFilter, TaskRegistry, TaskUpdate};
pub use strategy::{PriorityStrategy, SchedulingStrategy};
pub use task::{
    FnHandler, Handler, NewTask, ScheduleType, Task, TaskHandler, TaskOutcome, TaskStatus,
};
pub use vague_time::{translate_vague_term, VagueTermTable, VagueTranslation};
