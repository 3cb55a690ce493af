//! SQLite-backed task store.
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that string
//! comparison in SQL matches chronological order.
//!
//! rusqlite is synchronous, so every trait method runs its statements on the
//! blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use chime_core::traits::TaskStore;
use chime_core::{ChimeError, DeliveryMode, Payload, Recurrence, Result, Task, TaskId};

const COLUMNS: &str = "id, owner, target, origin, message, title, trigger_time, recurrence, \
                       last_fired, is_active, delivery_mode, created_at";

/// SQLite-backed persistence gateway.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open or create the reminder database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| store_err("DB open", e))?;
        // WAL for concurrent readers; ignore failure on exotic filesystems.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::with_connection(conn)
    }

    /// Ephemeral database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS reminders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                target TEXT NOT NULL,
                origin TEXT,
                message TEXT NOT NULL,
                title TEXT,
                trigger_time TEXT NOT NULL,      -- RFC 3339, UTC, microseconds
                recurrence TEXT,                 -- canonical spec, NULL = one-shot
                last_fired TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                delivery_mode TEXT NOT NULL DEFAULT 'direct',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reminders_due
                ON reminders(is_active, trigger_time);
            CREATE INDEX IF NOT EXISTS idx_reminders_owner
                ON reminders(owner, is_active, trigger_time);
            ",
        )
        .map_err(|e| store_err("Migration", e))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ChimeError::Store(format!("Lock: {e}")))
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| ChimeError::Store(format!("Lock: {e}")))?;
            f(&conn)
        })
        .await
        .map_err(|e| ChimeError::Store(format!("Blocking task: {e}")))?
    }
}

/// Run a multi-row query, skipping rows that fail to decode.
fn query_tasks(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql).map_err(|e| store_err("Prepare", e))?;
    let rows = stmt
        .query_map(args, RawTask::from_row)
        .map_err(|e| store_err("Query", e))?;

    let mut tasks = Vec::new();
    for row in rows {
        let raw = row.map_err(|e| store_err("Row", e))?;
        let id = raw.id;
        match raw.into_task() {
            Ok(task) => tasks.push(task),
            Err(e) => tracing::warn!("⚠️ Skipping unreadable reminder {}: {e}", id),
        }
    }
    Ok(tasks)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load_active_future(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM reminders \
             WHERE is_active = 1 AND trigger_time > ?1 ORDER BY trigger_time"
        );
        let now = ts(now);
        self.blocking(move |conn| query_tasks(conn, &sql, params![now]))
            .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let raw = self
            .blocking(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM reminders WHERE id = ?1"),
                    [id],
                    RawTask::from_row,
                )
                .optional()
                .map_err(|e| store_err("Get", e))
            })
            .await?;
        raw.map(|r| r.into_task().map_err(ChimeError::Store))
            .transpose()
    }

    async fn insert(&self, task: &Task) -> Result<TaskId> {
        let task = task.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO reminders
                 (owner, target, origin, message, title, trigger_time, recurrence,
                  last_fired, is_active, delivery_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.owner,
                    task.target,
                    task.origin,
                    task.payload.message,
                    task.payload.title,
                    ts(task.trigger_time),
                    task.recurrence.map(|r| r.to_string()),
                    task.last_fired.map(ts),
                    task.is_active,
                    task.delivery_mode.as_str(),
                    ts(task.created_at),
                ],
            )
            .map_err(|e| store_err("Insert", e))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.blocking(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE reminders SET
                        owner = ?2, target = ?3, origin = ?4, message = ?5, title = ?6,
                        trigger_time = ?7, recurrence = ?8, last_fired = ?9,
                        is_active = ?10, delivery_mode = ?11
                     WHERE id = ?1",
                    params![
                        task.id,
                        task.owner,
                        task.target,
                        task.origin,
                        task.payload.message,
                        task.payload.title,
                        ts(task.trigger_time),
                        task.recurrence.map(|r| r.to_string()),
                        task.last_fired.map(ts),
                        task.is_active,
                        task.delivery_mode.as_str(),
                    ],
                )
                .map_err(|e| store_err("Update", e))?;
            if changed == 0 {
                return Err(ChimeError::Store(format!("Update: no reminder with id {}", task.id)));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute("DELETE FROM reminders WHERE id = ?1", [id])
                .map_err(|e| store_err("Delete", e))?;
            Ok(())
        })
        .await
    }

    async fn list_active_for_owner(&self, owner: &str, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM reminders \
             WHERE owner = ?1 AND is_active = 1 AND trigger_time > ?2 ORDER BY trigger_time"
        );
        let (owner, now) = (owner.to_string(), ts(now));
        self.blocking(move |conn| query_tasks(conn, &sql, params![owner, now]))
            .await
    }
}

/// Row as stored, before timestamp/recurrence decoding.
struct RawTask {
    id: TaskId,
    owner: String,
    target: String,
    origin: Option<String>,
    message: String,
    title: Option<String>,
    trigger_time: String,
    recurrence: Option<String>,
    last_fired: Option<String>,
    is_active: bool,
    delivery_mode: String,
    created_at: String,
}

impl RawTask {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            target: row.get(2)?,
            origin: row.get(3)?,
            message: row.get(4)?,
            title: row.get(5)?,
            trigger_time: row.get(6)?,
            recurrence: row.get(7)?,
            last_fired: row.get(8)?,
            is_active: row.get(9)?,
            delivery_mode: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_task(self) -> std::result::Result<Task, String> {
        let recurrence = match self.recurrence.as_deref() {
            Some(spec) => Recurrence::parse(spec).map_err(|e| e.to_string())?,
            None => None,
        };
        let delivery_mode = DeliveryMode::parse(&self.delivery_mode)
            .ok_or_else(|| format!("unknown delivery mode '{}'", self.delivery_mode))?;
        Ok(Task {
            id: self.id,
            owner: self.owner,
            target: self.target,
            origin: self.origin,
            payload: Payload {
                message: self.message,
                title: self.title,
            },
            trigger_time: parse_ts(&self.trigger_time)?,
            recurrence,
            last_fired: self.last_fired.as_deref().map(parse_ts).transpose()?,
            is_active: self.is_active,
            delivery_mode,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

fn store_err(op: &str, e: rusqlite::Error) -> ChimeError {
    ChimeError::Store(format!("{op}: {e}"))
}
