//! Embedded SQLite Task Store.
//!
//! Holds the task queue, analysis tasks, key-value app state and system
//! logs in a single database file. Only the Coordination Service opens
//! it in production; every other process goes through RPC.

mod analysis;
mod lock;
mod logs;
mod state;
mod tasks;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{TaskStatus, UnknownStatus};

pub use lock::OwnerLock;

/// Errors raised by the Task Store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Status(#[from] UnknownStatus),

    #[error("Invalid timestamp in column {column}: {value}")]
    Timestamp { column: &'static str, value: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store is already owned by another process (lock: {})", .0.display())]
    Locked(PathBuf),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL UNIQUE,
    type TEXT NOT NULL DEFAULT 'transcribe',
    status TEXT NOT NULL DEFAULT 'queued',
    progress INTEGER NOT NULL DEFAULT 0,
    payload TEXT,
    result TEXT,
    depends_on TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);

CREATE TABLE IF NOT EXISTS analysis_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_file_id INTEGER NOT NULL UNIQUE,
    source_filename TEXT,
    stage1_status TEXT NOT NULL DEFAULT 'pending',
    stage1_output_path TEXT,
    stage1_error TEXT,
    stage2_status TEXT NOT NULL DEFAULT 'pending',
    stage2_output_path TEXT,
    stage2_error TEXT,
    model_used TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS app_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_log_source_level ON system_logs (source, level);
"#;

/// Columns older `tasks` tables may lack, added in place on initialize
const TASK_COLUMN_MIGRATIONS: &[(&str, &str)] = &[
    ("progress", "INTEGER DEFAULT 0"),
    ("type", "TEXT DEFAULT 'transcribe'"),
    ("depends_on", "TEXT"),
];

/// Handle to the task database
#[derive(Debug)]
pub struct TaskStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl TaskStore {
    /// Open (creating if needed) the database file and initialize the schema
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn,
            path: Some(path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// In-memory store (tests and throwaway tooling)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, path: None };
        store.initialize()?;
        Ok(store)
    }

    /// Path of the backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create tables if missing, add columns missing from older `tasks`
    /// tables, and normalize legacy status spellings. Safe to call repeatedly.
    pub fn initialize(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        self.migrate_task_columns()?;
        self.conn
            .execute_batch("CREATE INDEX IF NOT EXISTS idx_tasks_depends_on ON tasks (depends_on);")?;
        let rewritten = self.normalize_statuses()?;
        if rewritten > 0 {
            info!(rewritten, "Normalized legacy task statuses");
        }
        Ok(())
    }

    fn migrate_task_columns(&self) -> StoreResult<()> {
        let existing: Vec<String> = {
            let mut stmt = self.conn.prepare("PRAGMA table_info(tasks)")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            rows.collect::<Result<_, _>>()?
        };

        for (column, definition) in TASK_COLUMN_MIGRATIONS {
            if !existing.iter().any(|c| c == column) {
                self.conn
                    .execute_batch(&format!("ALTER TABLE tasks ADD COLUMN {column} {definition}"))?;
                info!(column, "Added missing column to tasks");
            }
        }
        Ok(())
    }

    /// Rewrite every non-canonical status to its canonical spelling
    fn normalize_statuses(&self) -> StoreResult<usize> {
        let statuses: Vec<String> = {
            let mut stmt = self.conn.prepare("SELECT DISTINCT status FROM tasks")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut rewritten = 0;
        for raw in statuses {
            match raw.parse::<TaskStatus>() {
                Ok(status) if status.as_str() != raw => {
                    rewritten += self.conn.execute(
                        "UPDATE tasks SET status = ?1 WHERE status = ?2",
                        params![status.as_str(), raw],
                    )?;
                }
                Ok(_) => {}
                Err(_) => warn!(status = %raw, "Leaving unrecognized task status untouched"),
            }
        }
        Ok(rewritten)
    }
}

/// Current time in the stored text format
pub(crate) fn now_text() -> String {
    timestamp_text(Utc::now())
}

/// RFC 3339 with millisecond precision; sorts lexicographically in UTC
pub(crate) fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, accepting SQLite's `CURRENT_TIMESTAMP` layout too
pub(crate) fn parse_timestamp(column: &'static str, value: &str) -> StoreResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| StoreError::Timestamp {
            column,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file_and_parent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("lectern.db");

        let store = TaskStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = TaskStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store.initialize().unwrap();
    }

    #[test]
    fn test_legacy_statuses_rewritten_on_initialize() {
        let store = TaskStore::open_in_memory().unwrap();
        let now = now_text();
        store
            .conn
            .execute(
                "INSERT INTO tasks (task_id, status, created_at, updated_at) VALUES ('a', '處理中', ?1, ?1)",
                params![now],
            )
            .unwrap();
        store
            .conn
            .execute(
                "INSERT INTO tasks (task_id, status, created_at, updated_at) VALUES ('b', '已完成', ?1, ?1)",
                params![now],
            )
            .unwrap();

        store.initialize().unwrap();

        assert_eq!(store.get_task_status("a").unwrap().unwrap().status, TaskStatus::Queued);
        assert_eq!(store.get_task_status("b").unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("created_at", "2025-09-12T08:30:00.123Z").unwrap();
        let sqlite = parse_timestamp("created_at", "2025-09-12 08:30:00").unwrap();
        assert_eq!(rfc.timestamp(), sqlite.timestamp());
        assert!(parse_timestamp("created_at", "yesterday").is_err());
    }
}
