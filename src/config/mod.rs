// Configuration module
// Public interface for configuration loading

mod loader;
mod settings;

pub use loader::{
    apply_env_overrides, config_dir, default_config_path, default_db_path, load_config,
};
pub use settings::{
    OrphanPolicy, RegistryConfig, RetryPolicy, SchedulerConfig, DEFAULT_INTERVAL_MS,
    DEFAULT_MAX_CONCURRENT,
};
