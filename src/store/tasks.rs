use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::domain::{NewTask, Task, TaskStatus};

use super::{now_text, parse_timestamp, StoreError, StoreResult, TaskStore};

const TASK_COLUMNS: &str =
    "task_id, type, status, progress, payload, result, depends_on, created_at, updated_at";

/// Eligible = queued, and either independent or waiting on a completed task.
/// Independent tasks first, then creation order. Ordered and claimed by
/// `rowid` so tables keyed by `seq` or by an older `id` column both work.
const NEXT_ELIGIBLE: &str = r#"
SELECT t.rowid, task_id, type, status, progress, payload, result, depends_on, created_at, updated_at
FROM tasks AS t
WHERE t.status = 'queued'
  AND (
    t.depends_on IS NULL
    OR EXISTS (
      SELECT 1 FROM tasks AS parent
      WHERE parent.task_id = t.depends_on AND parent.status = 'completed'
    )
  )
ORDER BY (t.depends_on IS NOT NULL), t.rowid
LIMIT 1
"#;

impl TaskStore {
    /// Insert a queued task. A duplicate id returns `false` instead of failing.
    pub fn add_task(&self, task: &NewTask) -> StoreResult<bool> {
        let now = now_text();
        let payload = serde_json::to_string(&task.payload)?;

        let inserted = self.conn.execute(
            r#"
            INSERT INTO tasks (task_id, type, status, progress, payload, depends_on, created_at, updated_at)
            VALUES (?1, ?2, 'queued', 0, ?3, ?4, ?5, ?5)
            ON CONFLICT(task_id) DO NOTHING
            "#,
            params![task.task_id, task.task_type, payload, task.depends_on, now],
        )?;

        if inserted == 0 {
            warn!(task_id = %task.task_id, "Task id already exists");
            return Ok(false);
        }

        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            depends_on = task.depends_on.as_deref().unwrap_or("-"),
            "Task queued"
        );
        Ok(true)
    }

    /// Claim the oldest eligible task, flipping it to `processing` in the
    /// same write transaction. At most one caller ever receives a given task.
    pub fn fetch_and_lock_task(&mut self) -> StoreResult<Option<Task>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate = tx
            .query_row(NEXT_ELIGIBLE, [], |row| {
                let rowid: i64 = row.get(0)?;
                Ok((rowid, RawTask::from_row(row, 1)?))
            })
            .optional()?;

        let Some((rowid, raw)) = candidate else {
            tx.commit()?;
            debug!("No eligible task");
            return Ok(None);
        };

        // decode before claiming; an error here drops `tx` and leaves the row queued
        let mut task = raw.into_task()?;

        let now = now_text();
        let claimed = tx.execute(
            "UPDATE tasks SET status = 'processing', updated_at = ?1 WHERE rowid = ?2 AND status = 'queued'",
            params![now, rowid],
        )?;
        tx.commit()?;

        if claimed == 0 {
            return Ok(None);
        }

        task.status = TaskStatus::Processing;
        task.updated_at = parse_timestamp("updated_at", &now)?;
        info!(task_id = %task.task_id, task_type = %task.task_type, "Task locked");
        Ok(Some(task))
    }

    /// Overwrite status and result. No transition validation.
    /// Returns whether the task exists.
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&serde_json::Value>,
    ) -> StoreResult<bool> {
        let result = result.map(serde_json::to_string).transpose()?;
        let updated = self.conn.execute(
            "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 WHERE task_id = ?4",
            params![status.as_str(), result, now_text(), task_id],
        )?;

        if updated == 0 {
            warn!(task_id, %status, "Status update for unknown task");
        } else {
            info!(task_id, %status, "Task status updated");
        }
        Ok(updated > 0)
    }

    /// Overwrite progress (clamped to 0..=100) and partial result
    pub fn update_task_progress(
        &self,
        task_id: &str,
        progress: i64,
        partial_result: &serde_json::Value,
    ) -> StoreResult<bool> {
        let progress = progress.clamp(0, 100);
        let partial = serde_json::to_string(partial_result)?;
        let updated = self.conn.execute(
            "UPDATE tasks SET progress = ?1, result = ?2, updated_at = ?3 WHERE task_id = ?4",
            params![progress, partial, now_text(), task_id],
        )?;
        debug!(task_id, progress, "Task progress updated");
        Ok(updated > 0)
    }

    /// Look up a single task
    pub fn get_task_status(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1");
        self.conn
            .query_row(&sql, params![task_id], |row| RawTask::from_row(row, 0))
            .optional()?
            .map(RawTask::into_task)
            .transpose()
    }

    /// All tasks, newest first. Rows that cannot be decoded are skipped.
    pub fn get_all_tasks(&self) -> StoreResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY rowid DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], |row| RawTask::from_row(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tasks = Vec::with_capacity(raws.len());
        for raw in raws {
            let task_id = raw.task_id.clone();
            match raw.into_task() {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(%task_id, error = %e, "Skipping undecodable task row"),
            }
        }
        Ok(tasks)
    }

    /// First task (by creation order) that depends on `parent_task_id`
    pub fn find_dependent_task(&self, parent_task_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT task_id FROM tasks WHERE depends_on = ?1 ORDER BY rowid LIMIT 1",
                params![parent_task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    /// Whether any task is queued or processing
    pub fn are_tasks_active(&self) -> StoreResult<bool> {
        let active = self
            .conn
            .query_row(
                "SELECT 1 FROM tasks WHERE status IN ('queued', 'processing') LIMIT 1",
                [],
                |_| Ok(()),
            )
            .optional()?;
        Ok(active.is_some())
    }

    /// Delete every task. Returns the number removed.
    pub fn clear_all_tasks(&self) -> StoreResult<usize> {
        let removed = self.conn.execute("DELETE FROM tasks", [])?;
        info!(removed, "Cleared all tasks");
        Ok(removed)
    }
}

/// Column values before JSON decoding
struct RawTask {
    task_id: String,
    task_type: Option<String>,
    status: String,
    progress: Option<i64>,
    payload: Option<String>,
    result: Option<String>,
    depends_on: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawTask {
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(offset)?,
            task_type: row.get(offset + 1)?,
            status: row.get(offset + 2)?,
            progress: row.get(offset + 3)?,
            payload: row.get(offset + 4)?,
            result: row.get(offset + 5)?,
            depends_on: row.get(offset + 6)?,
            created_at: row.get(offset + 7)?,
            updated_at: row.get(offset + 8)?,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        let payload = match self.payload {
            Some(text) => serde_json::from_str(&text)?,
            None => serde_json::Value::Null,
        };
        let result = self
            .result
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(StoreError::from)?;

        Ok(Task {
            task_id: self.task_id,
            task_type: self.task_type.unwrap_or_else(|| "transcribe".to_string()),
            status: self.status.parse()?,
            progress: self.progress.unwrap_or(0).clamp(0, 100) as u8,
            payload,
            result,
            depends_on: self.depends_on,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}
