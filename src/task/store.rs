//! Durable task records.
//!
//! The orchestration core only ever writes `status`, `updated_at`,
//! `completed_at`, and `last_error`; everything else is owned by whoever
//! creates tasks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::{Task, TaskStatus};
use crate::cli::CliKind;
use crate::error::{Result, WardenError};

pub trait TaskStore: Send + Sync {
    fn create(&self, task: &Task) -> Result<()>;
    fn get(&self, task_id: &str) -> Result<Option<Task>>;
    fn all(&self) -> Result<Vec<Task>>;
    fn by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    fn set_status(&self, task_id: &str, status: TaskStatus, error: Option<&str>) -> Result<()>;
    fn delete(&self, task_id: &str) -> Result<bool>;
}

/// Rejects tasks whose project directory or document is missing on disk.
pub fn validate_paths(project_dir: &Path, doc_path: &Path) -> Result<()> {
    if !project_dir.is_dir() {
        return Err(WardenError::ProjectDirMissing(
            project_dir.display().to_string(),
        ));
    }
    let full = project_dir.join(doc_path);
    if !full.is_file() {
        return Err(WardenError::DocumentMissing(full.display().to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn create(&self, task: &Task) -> Result<()> {
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    fn all(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<_> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    fn by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    fn set_status(&self, task_id: &str, status: TaskStatus, error: Option<&str>) -> Result<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WardenError::TaskNotFound(task_id.to_string()))?;
        task.status = status;
        task.updated_at = Utc::now();
        if status.is_terminal() {
            task.completed_at = Some(task.updated_at);
        }
        if let Some(err) = error {
            task.last_error = Some(err.to_string());
        }
        Ok(())
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        Ok(self.tasks.lock().remove(task_id).is_some())
    }
}

pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project_dir TEXT NOT NULL,
                doc_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                cli_kind TEXT,
                review TEXT NOT NULL DEFAULT 'inherit',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let status: String = row.get("status")?;
        let cli_kind: Option<String> = row.get("cli_kind")?;
        let review: String = row.get("review")?;
        Ok(Task {
            id: row.get("id")?,
            project_dir: PathBuf::from(row.get::<_, String>("project_dir")?),
            doc_path: PathBuf::from(row.get::<_, String>("doc_path")?),
            status: parse_enum(&status).unwrap_or_default(),
            cli_kind: cli_kind.as_deref().and_then(|k| parse_enum::<CliKind>(k).ok()),
            review: parse_enum(&review).unwrap_or_default(),
            created_at: parse_ts(row.get::<_, String>("created_at")?),
            updated_at: parse_ts(row.get::<_, String>("updated_at")?),
            completed_at: row
                .get::<_, Option<String>>("completed_at")?
                .map(parse_ts),
            last_error: row.get("last_error")?,
        })
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn parse_enum<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(WardenError::from)
}

fn enum_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, task: &Task) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO tasks
                (id, project_dir, doc_path, status, cli_kind, review,
                 created_at, updated_at, completed_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.project_dir.display().to_string(),
                task.doc_path.display().to_string(),
                task.status.as_str(),
                task.cli_kind.as_ref().map(enum_str),
                enum_str(&task.review),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.last_error,
            ],
        )?;
        Ok(())
    }

    fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let task = conn
            .query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![task_id],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    fn all(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at")?;
        let tasks = stmt
            .query_map([], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at")?;
        let tasks = stmt
            .query_map(params![status.as_str()], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn set_status(&self, task_id: &str, status: TaskStatus, error: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());
        let changed = self.conn.lock().execute(
            "UPDATE tasks
             SET status = ?2,
                 updated_at = ?3,
                 completed_at = COALESCE(?4, completed_at),
                 last_error = COALESCE(?5, last_error)
             WHERE id = ?1",
            params![task_id, status.as_str(), now, completed_at, error],
        )?;
        if changed == 0 {
            return Err(WardenError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(changed > 0)
    }
}
