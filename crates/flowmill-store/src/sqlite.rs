use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use flowmill_core::definition::ProcessDefinition;
use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::{DefinitionStore, InstanceRepository, TaskRepository};
use flowmill_core::types::{Instance, InstanceStatus, Task, TaskStatus};

/// Rows keep a few indexed columns next to the full JSON body.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS definitions (
        id TEXT NOT NULL,
        version INTEGER NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (id, version)
    );

    CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY,
        definition_id TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        start_time TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);

    CREATE TABLE IF NOT EXISTS tasks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        instance_id TEXT NOT NULL,
        status TEXT NOT NULL,
        assignee_id TEXT,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_instance ON tasks(instance_id, seq);
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, assignee_id);";

const OPEN_STATUSES: [TaskStatus; 3] = [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Waiting];

fn db(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

/// SQLite-backed store for definitions, instances, and tasks.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))
    }

    fn query_tasks(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db)?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))
            .map_err(db)?;
        let mut tasks = Vec::new();
        for body in rows {
            tasks.push(serde_json::from_str(&body.map_err(db)?)?);
        }
        Ok(tasks)
    }
}

impl DefinitionStore for SqliteStore {
    fn get_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<ProcessDefinition>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM definitions WHERE id = ?1 ORDER BY version DESC LIMIT 1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
    }

    fn get_definition_version(
        &self,
        id: &str,
        version: u32,
    ) -> BoxFuture<'_, Result<Option<ProcessDefinition>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM definitions WHERE id = ?1 AND version = ?2",
                    params![id, version],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
    }

    fn save_definition(&self, def: &ProcessDefinition) -> BoxFuture<'_, Result<()>> {
        let def = def.clone();
        Box::pin(async move {
            def.graph.validate()?;
            let body = serde_json::to_string(&def)?;
            let conn = self.conn()?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT status FROM definitions WHERE id = ?1 AND version = ?2",
                    params![def.id, def.version],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            if existing.as_deref() == Some("published") {
                return Err(FlowError::InvalidState(format!(
                    "definition {} v{} is published and immutable",
                    def.id, def.version
                )));
            }
            conn.execute(
                "INSERT OR REPLACE INTO definitions (id, version, status, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    def.id,
                    def.version,
                    def.status.as_str(),
                    body,
                    def.created_at.to_rfc3339()
                ],
            )
            .map_err(db)?;
            debug!(definition_id = %def.id, version = def.version, "Definition saved");
            Ok(())
        })
    }
}

impl InstanceRepository for SqliteStore {
    fn get_instance(&self, id: &str) -> BoxFuture<'_, Result<Option<Instance>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM instances WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db)?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
    }

    fn insert_instance(&self, instance: &Instance) -> BoxFuture<'_, Result<()>> {
        let instance = instance.clone();
        Box::pin(async move {
            let body = serde_json::to_string(&instance)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO instances (id, definition_id, status, body, start_time, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    instance.id,
                    instance.definition_id,
                    instance.status.as_str(),
                    body,
                    instance.start_time.to_rfc3339(),
                    instance.updated_at.to_rfc3339()
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn save_instance(&self, instance: &Instance) -> BoxFuture<'_, Result<()>> {
        let instance = instance.clone();
        Box::pin(async move {
            let body = serde_json::to_string(&instance)?;
            let conn = self.conn()?;
            let changed = conn
                .execute(
                    "UPDATE instances SET status = ?2, body = ?3, updated_at = ?4 WHERE id = ?1",
                    params![
                        instance.id,
                        instance.status.as_str(),
                        body,
                        instance.updated_at.to_rfc3339()
                    ],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(FlowError::not_found("instance", instance.id));
            }
            Ok(())
        })
    }

    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> BoxFuture<'_, Result<Vec<Instance>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT body FROM instances
                     WHERE ?1 IS NULL OR status = ?1
                     ORDER BY start_time ASC, id ASC",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db)?;
            let mut out = Vec::new();
            for body in rows {
                out.push(serde_json::from_str(&body.map_err(db)?)?);
            }
            Ok(out)
        })
    }
}

impl TaskRepository for SqliteStore {
    fn get_task(&self, id: &str) -> BoxFuture<'_, Result<Option<Task>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let body: Option<String> = conn
                .query_row("SELECT body FROM tasks WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db)?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
    }

    fn insert_task(&self, task: &Task) -> BoxFuture<'_, Result<()>> {
        let task = task.clone();
        Box::pin(async move {
            let body = serde_json::to_string(&task)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO tasks (id, instance_id, status, assignee_id, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task.id,
                    task.instance_id,
                    task.status.as_str(),
                    task.assignee_id,
                    body
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn save_task(&self, task: &Task) -> BoxFuture<'_, Result<()>> {
        let task = task.clone();
        Box::pin(async move {
            let body = serde_json::to_string(&task)?;
            let conn = self.conn()?;
            let changed = conn
                .execute(
                    "UPDATE tasks SET status = ?2, assignee_id = ?3, body = ?4 WHERE id = ?1",
                    params![task.id, task.status.as_str(), task.assignee_id, body],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(FlowError::not_found("task", task.id));
            }
            Ok(())
        })
    }

    fn tasks_for_instance(&self, instance_id: &str) -> BoxFuture<'_, Result<Vec<Task>>> {
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            self.query_tasks(
                "SELECT body FROM tasks WHERE instance_id = ?1 ORDER BY seq ASC",
                params![instance_id],
            )
        })
    }

    fn open_tasks(&self) -> BoxFuture<'_, Result<Vec<Task>>> {
        Box::pin(async move {
            let [a, b, c] = OPEN_STATUSES.map(|s| s.as_str());
            self.query_tasks(
                "SELECT body FROM tasks WHERE status IN (?1, ?2, ?3) ORDER BY seq ASC",
                params![a, b, c],
            )
        })
    }

    fn count_open_for_assignee(&self, user_id: &str) -> BoxFuture<'_, Result<usize>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let [a, b, c] = OPEN_STATUSES.map(|s| s.as_str());
            let conn = self.conn()?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM tasks WHERE assignee_id = ?1 AND status IN (?2, ?3, ?4)",
                    params![user_id, a, b, c],
                    |row| row.get(0),
                )
                .map_err(db)?;
            Ok(count as usize)
        })
    }
}
