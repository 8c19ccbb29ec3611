// Configuration loader
// Reads ~/.taskloop/config.toml (or an explicit path), then applies
// TASKLOOP_* environment overrides.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::{RegistryConfig, SchedulerConfig};

pub const ENV_INTERVAL_MS: &str = "TASKLOOP_INTERVAL_MS";
pub const ENV_MAX_CONCURRENT: &str = "TASKLOOP_MAX_CONCURRENT";
pub const ENV_DB: &str = "TASKLOOP_DB";

/// `~/.taskloop`
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".taskloop"))
}

/// `~/.taskloop/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// `~/.taskloop/tasks.db`
pub fn default_db_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("tasks.db"))
}

/// Load configuration.
///
/// An explicit `path` must exist. Without one, the default location is used
/// when present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<SchedulerConfig> {
    let mut config = match path {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            read_config_file(path)?
        }
        None => {
            let default_path = default_config_path()?;
            if default_path.exists() {
                read_config_file(&default_path)?
            } else {
                tracing::debug!("No config at {}, using defaults", default_path.display());
                SchedulerConfig::default()
            }
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    config
        .validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

fn read_config_file(path: &Path) -> Result<SchedulerConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: SchedulerConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Apply `TASKLOOP_*` overrides. `lookup` is injected so tests don't touch
/// the process environment.
pub fn apply_env_overrides<F>(config: &mut SchedulerConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(ENV_INTERVAL_MS) {
        config.scheduling_interval_ms = raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be an integer, got '{}'", ENV_INTERVAL_MS, raw))?;
    }
    if let Some(raw) = lookup(ENV_MAX_CONCURRENT) {
        config.max_concurrent_tasks = raw.trim().parse().with_context(|| {
            format!("{} must be an integer, got '{}'", ENV_MAX_CONCURRENT, raw)
        })?;
    }
    if let Some(raw) = lookup(ENV_DB) {
        if !raw.trim().is_empty() {
            config.registry = RegistryConfig::Sqlite {
                path: PathBuf::from(raw.trim()),
            };
        }
    }
    Ok(())
}
