// SQLite task registry
//
// Durable backend: task metadata and Named handler references survive a
// restart. Direct (closure) handlers cannot be stored, so they live in an
// in-process side table and must be re-attached after reopening.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{check_edge, TaskFilter, TaskRegistry, TaskUpdate};
use crate::errors::{SchedulerError, SchedulerResult};
use crate::scheduling::task::{
    new_task_id, Handler, ScheduleType, Task, TaskHandler, TaskOutcome, TaskStatus,
};

const COLUMNS: &str = "id, name, description, schedule, priority, status, scheduled_time, \
                       created_at, updated_at, handler_kind, action, parameters, attempts, \
                       result, last_error";

pub struct SqliteRegistry {
    db: Mutex<Connection>,
    path: PathBuf,
    /// Direct handlers keyed by task id
    attached: DashMap<String, Arc<dyn Handler>>,
}

/// Raw column values, converted outside the rusqlite row closure
struct TaskRow {
    id: String,
    name: String,
    description: String,
    schedule: String,
    priority: i64,
    status: String,
    scheduled_time: Option<String>,
    created_at: String,
    updated_at: String,
    handler_kind: Option<String>,
    action: Option<String>,
    parameters: String,
    attempts: i64,
    result: Option<String>,
    last_error: Option<String>,
}

impl SqliteRegistry {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SchedulerError::backend(format!(
                        "failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        tracing::info!("Task registry opened: {}", path.display());

        Ok(Self {
            db: Mutex::new(conn),
            path,
            attached: DashMap::new(),
        })
    }

    fn handler_for(&self, row: &TaskRow) -> Option<TaskHandler> {
        match row.handler_kind.as_deref() {
            Some("direct") => self
                .attached
                .get(&row.id)
                .map(|h| TaskHandler::Direct(Arc::clone(h.value()))),
            Some("named") => row.action.clone().map(TaskHandler::named),
            _ => None,
        }
    }

    fn to_task(&self, row: TaskRow) -> SchedulerResult<Task> {
        let handler = self.handler_for(&row);
        let parameters: Map<String, Value> = serde_json::from_str(&row.parameters)?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;
        Ok(Task {
            id: row.id,
            name: row.name,
            description: row.description,
            schedule: serde_json::from_str::<ScheduleType>(&row.schedule)?,
            priority: u8::try_from(row.priority)
                .map_err(|_| SchedulerError::backend(format!("bad priority {}", row.priority)))?,
            status: row
                .status
                .parse()
                .map_err(|e: SchedulerError| SchedulerError::backend(e.to_string()))?,
            scheduled_time: row.scheduled_time.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&row.created_at)?,
            updated_at: parse_time(&row.updated_at)?,
            handler,
            parameters,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            result,
            last_error: row.last_error,
        })
    }

    fn load(&self, conn: &Connection, id: &str) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS);
        let row = conn.query_row(&sql, [id], read_row).optional()?;
        row.map(|r| self.to_task(r)).transpose()
    }

    /// Write every mutable column, conditional on the expected status.
    fn write_guarded(
        conn: &Connection,
        task: &Task,
        expected: TaskStatus,
    ) -> SchedulerResult<bool> {
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let changed = conn.execute(
            "UPDATE tasks SET name = ?1, description = ?2, priority = ?3, status = ?4,
                 scheduled_time = ?5, updated_at = ?6, parameters = ?7, attempts = ?8,
                 result = ?9, last_error = ?10
             WHERE id = ?11 AND status = ?12",
            params![
                task.name,
                task.description,
                i64::from(task.priority),
                task.status.as_str(),
                task.scheduled_time.map(format_time),
                format_time(task.updated_at),
                serde_json::to_string(&task.parameters)?,
                i64::from(task.attempts),
                result,
                task.last_error,
                task.id,
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        schedule: row.get(3)?,
        priority: row.get(4)?,
        status: row.get(5)?,
        scheduled_time: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        handler_kind: row.get(9)?,
        action: row.get(10)?,
        parameters: row.get(11)?,
        attempts: row.get(12)?,
        result: row.get(13)?,
        last_error: row.get(14)?,
    })
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> SchedulerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SchedulerError::backend(format!("bad timestamp '{}': {}", s, e)))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl TaskRegistry for SqliteRegistry {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_task(&self, mut task: Task) -> SchedulerResult<Task> {
        task.validate()?;
        if task.id.is_empty() {
            task.id = new_task_id();
        }
        let now = Utc::now();
        task.created_at = now;
        task.updated_at = now;

        let (handler_kind, action) = match &task.handler {
            Some(TaskHandler::Direct(_)) => (Some("direct"), None),
            Some(TaskHandler::Named { action }) => (Some("named"), Some(action.clone())),
            None => (None, None),
        };
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.db.lock().await;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                COLUMNS
            ),
            params![
                task.id,
                task.name,
                task.description,
                serde_json::to_string(&task.schedule)?,
                i64::from(task.priority),
                task.status.as_str(),
                task.scheduled_time.map(format_time),
                format_time(task.created_at),
                format_time(task.updated_at),
                handler_kind,
                action,
                serde_json::to_string(&task.parameters)?,
                i64::from(task.attempts),
                result,
                task.last_error,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(SchedulerError::conflict(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(TaskHandler::Direct(handler)) = &task.handler {
            self.attached.insert(task.id.clone(), Arc::clone(handler));
        }
        tracing::debug!("Stored task {} ({})", task.id, task.name);
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let conn = self.db.lock().await;
        self.load(&conn, id)
    }

    async fn find_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let mut placeholders = Vec::with_capacity(ids.len());
            for id in ids {
                values.push(id.clone());
                placeholders.push(format!("?{}", values.len()));
            }
            clauses.push(format!("id IN ({})", placeholders.join(", ")));
        }

        let mut sql = format!("SELECT {} FROM tasks", COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<TaskRow> = stmt
            .query_map(params_from_iter(values.iter()), read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(|r| self.to_task(r)).collect()
    }

    async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> SchedulerResult<bool> {
        check_edge(from, to)?;
        let conn = self.db.lock().await;
        let mut task = self
            .load(&conn, id)?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if task.status != from {
            return Ok(false);
        }
        task.apply_transition(to, outcome, Utc::now());
        // The status guard in the UPDATE keeps this safe against other
        // processes sharing the database file.
        Self::write_guarded(&conn, &task, from)
    }

    async fn update_task(&self, id: &str, update: TaskUpdate) -> SchedulerResult<Task> {
        update.validate()?;
        let conn = self.db.lock().await;
        let mut task = self
            .load(&conn, id)?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(SchedulerError::conflict(format!(
                "task {} is {}; only pending tasks can be updated",
                id, task.status
            )));
        }
        update.apply(&mut task, Utc::now());
        if !Self::write_guarded(&conn, &task, TaskStatus::Pending)? {
            return Err(SchedulerError::conflict(format!(
                "task {} changed status during update",
                id
            )));
        }
        Ok(task)
    }

    async fn delete_task(&self, id: &str) -> SchedulerResult<bool> {
        let conn = self.db.lock().await;
        let removed = conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        self.attached.remove(id);
        Ok(removed > 0)
    }

    async fn reset(&self) -> SchedulerResult<()> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM tasks", [])?;
        self.attached.clear();
        tracing::info!("Task registry cleared: {}", self.path.display());
        Ok(())
    }

    async fn attach_handler(&self, id: &str, handler: TaskHandler) -> SchedulerResult<()> {
        let conn = self.db.lock().await;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        match handler {
            TaskHandler::Direct(h) => {
                conn.execute(
                    "UPDATE tasks SET handler_kind = 'direct', action = NULL WHERE id = ?1",
                    [id],
                )?;
                self.attached.insert(id.to_string(), h);
            }
            TaskHandler::Named { action } => {
                conn.execute(
                    "UPDATE tasks SET handler_kind = 'named', action = ?2 WHERE id = ?1",
                    params![id, action],
                )?;
                self.attached.remove(id);
            }
        }
        Ok(())
    }
}
