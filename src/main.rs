// taskloop - autonomous task scheduler
// Main entry point

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskloop::config::{default_db_path, load_config, RegistryConfig};
use taskloop::scheduling::{
    create_manager, ActionRegistry, NewTask, TaskFilter, TaskManager, TaskStatus,
};

/// Autonomous task scheduler: priorities, vague due times, durable storage.
#[derive(Parser)]
#[command(name = "taskloop", version, about)]
struct Cli {
    /// Path to TOML configuration file (default: ~/.taskloop/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database to use instead of the configured registry
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop until Ctrl+C
    Run,

    /// Add a task that runs a named action
    Add {
        /// Task name
        name: String,

        /// Action to run (log, sleep, fail)
        #[arg(short, long)]
        action: String,

        /// Action parameter as key=value (value parsed as JSON when possible)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Due time (RFC 3339)
        #[arg(long, conflicts_with_all = ["vague", "every_ms"])]
        at: Option<DateTime<Utc>>,

        /// Due time as a vague term, e.g. "urgent" or "when you have time"
        #[arg(long = "in", value_name = "TERM", conflicts_with = "every_ms")]
        vague: Option<String>,

        /// Repeat every N milliseconds
        #[arg(long)]
        every_ms: Option<u64>,

        /// Priority 1 (low) to 10 (high)
        #[arg(long)]
        priority: Option<u8>,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List tasks
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show one task as JSON
    Show { id: String },

    /// Execute a pending task now and wait for the outcome
    Exec { id: String },

    /// Cancel a pending task
    Cancel { id: String },

    /// Delete a task
    Delete { id: String },

    /// Translate a vague urgency term
    Translate { term: String },

    /// Show scheduler status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskloop=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.registry = RegistryConfig::Sqlite { path: db };
    } else if config.registry == RegistryConfig::Memory {
        // Separate invocations share tasks only through a file.
        config.registry = RegistryConfig::Sqlite {
            path: default_db_path()?,
        };
    }

    let manager = create_manager(config, ActionRegistry::with_builtins())
        .context("Failed to create task manager")?;

    match cli.command {
        Command::Run => run(&manager).await,
        Command::Add {
            name,
            action,
            params,
            at,
            vague,
            every_ms,
            priority,
            description,
        } => {
            let mut new = NewTask::new(name)
                .with_description(description)
                .with_action(action);
            for param in &params {
                let (key, value) = parse_param(param)?;
                new = new.with_param(key, value);
            }
            new = match (at, vague, every_ms) {
                (Some(at), _, _) => new.at(at),
                (_, Some(term), _) => new.vague(term),
                (_, _, Some(ms)) => new.every_ms(ms),
                (None, None, None) => new.at(Utc::now()),
            };
            if let Some(p) = priority {
                new = new.with_priority(p);
            }
            let task = manager.create_task(new).await?;
            print_json(&task)
        }
        Command::List { status, limit } => {
            let filter = TaskFilter {
                status,
                limit,
                ..Default::default()
            };
            let tasks = manager.find_tasks(&filter).await?;
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in tasks {
                println!(
                    "{}  {:<9}  p{:<2}  {:<25}  {}",
                    task.id,
                    task.status,
                    task.priority,
                    task.scheduled_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    task.name
                );
            }
            Ok(())
        }
        Command::Show { id } => match manager.get_task(&id).await? {
            Some(task) => print_json(&task),
            None => bail!("Task not found: {}", id),
        },
        Command::Exec { id } => {
            let result = manager.execute_task_now(&id).await?;
            print_json(&result)?;
            if result.requeued {
                println!("Task {} failed and was requeued for retry", id);
                return Ok(());
            }
            result.into_result()?;
            Ok(())
        }
        Command::Cancel { id } => {
            manager.cancel_task(&id).await?;
            println!("Cancelled {}", id);
            Ok(())
        }
        Command::Delete { id } => {
            if !manager.delete_task(&id).await? {
                bail!("Task not found: {}", id);
            }
            println!("Deleted {}", id);
            Ok(())
        }
        Command::Translate { term } => match manager.translate(&term, Utc::now()) {
            Some(translation) => print_json(&translation),
            None => bail!(
                "Unknown vague term: '{}' (known: {})",
                term,
                manager.known_terms().join(", ")
            ),
        },
        Command::Status => print_json(&manager.get_status().await),
    }
}

async fn run(manager: &TaskManager) -> Result<()> {
    println!("taskloop v{}", env!("CARGO_PKG_VERSION"));
    if !manager.start_scheduler().await? {
        bail!("Scheduler did not start (check `enabled` and `enable_auto_scheduling`)");
    }
    println!("Scheduler running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("received Ctrl+C, shutting down...");

    manager.stop_scheduler().await;
    let status = manager.get_status().await;
    println!(
        "Stopped after {} ticks: {} completed, {} failed, {} still running",
        status.ticks, status.completed, status.failed, status.active_executions
    );
    Ok(())
}

/// `key=value`; the value is JSON when it parses as JSON, a string otherwise.
fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("Parameter '{}' must look like key=value", raw);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Parameter '{}' has an empty key", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("ms=250").unwrap(), ("ms".into(), Value::from(250)));
        assert_eq!(
            parse_param("message=hello world").unwrap(),
            ("message".into(), Value::from("hello world"))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_add() {
        let cli = Cli::try_parse_from([
            "taskloop", "add", "backup", "--action", "log", "-p", "message=hi", "--in", "urgent",
        ])
        .unwrap();
        match cli.command {
            Command::Add { vague, params, .. } => {
                assert_eq!(vague.as_deref(), Some("urgent"));
                assert_eq!(params, ["message=hi"]);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_cli_rejects_conflicting_schedules() {
        assert!(Cli::try_parse_from([
            "taskloop", "add", "x", "--action", "log", "--in", "soon", "--every-ms", "10",
        ])
        .is_err());
    }

    #[test]
    fn test_cli_parses_status_filter() {
        let cli = Cli::try_parse_from(["taskloop", "list", "--status", "failed"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::List {
                status: Some(TaskStatus::Failed),
                ..
            }
        ));
    }
}
