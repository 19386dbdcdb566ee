use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use crate::domain::{AnalysisTask, StageUpdate};

use super::{now_text, parse_timestamp, StoreError, StoreResult, TaskStore};

const ANALYSIS_COLUMNS: &str = "id, source_file_id, source_filename, \
     stage1_status, stage1_output_path, stage1_error, \
     stage2_status, stage2_output_path, stage2_error, \
     model_used, created_at, updated_at";

impl TaskStore {
    /// Return the analysis task for a source file, creating it on first use
    pub fn create_or_get_analysis_task(
        &self,
        source_file_id: i64,
        source_filename: Option<&str>,
    ) -> StoreResult<AnalysisTask> {
        let now = now_text();
        let created = self.conn.execute(
            r#"
            INSERT INTO analysis_tasks (source_file_id, source_filename, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(source_file_id) DO NOTHING
            "#,
            params![source_file_id, source_filename, now],
        )?;
        if created > 0 {
            info!(source_file_id, "Analysis task created");
        }

        self.get_analysis_task_by_file(source_file_id)?
            .ok_or_else(|| StoreError::NotFound(format!("analysis task for file {source_file_id}")))
    }

    /// Look up an analysis task by its own id
    pub fn get_analysis_task(&self, id: i64) -> StoreResult<Option<AnalysisTask>> {
        let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM analysis_tasks WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], RawAnalysis::from_row)
            .optional()?
            .map(RawAnalysis::into_analysis)
            .transpose()
    }

    /// Look up an analysis task by source file
    pub fn get_analysis_task_by_file(&self, source_file_id: i64) -> StoreResult<Option<AnalysisTask>> {
        let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM analysis_tasks WHERE source_file_id = ?1");
        self.conn
            .query_row(&sql, params![source_file_id], RawAnalysis::from_row)
            .optional()?
            .map(RawAnalysis::into_analysis)
            .transpose()
    }

    /// All analysis tasks, newest first
    pub fn get_all_analysis_tasks(&self) -> StoreResult<Vec<AnalysisTask>> {
        let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM analysis_tasks ORDER BY id DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], RawAnalysis::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawAnalysis::into_analysis).collect()
    }

    /// Apply a stage transition. `model_used` is only overwritten when given.
    pub fn update_analysis_task(&self, id: i64, update: &StageUpdate) -> StoreResult<bool> {
        let prefix = update.stage.column_prefix();
        // prefix comes from a closed enum, never from input
        let sql = format!(
            "UPDATE analysis_tasks SET {prefix}_status = ?1, {prefix}_output_path = ?2, \
             {prefix}_error = ?3, model_used = COALESCE(?4, model_used), updated_at = ?5 \
             WHERE id = ?6"
        );
        let updated = self.conn.execute(
            &sql,
            params![
                update.status.as_str(),
                update.output_path,
                update.error,
                update.model_used,
                now_text(),
                id
            ],
        )?;
        info!(id, stage = prefix, status = %update.status, "Analysis task updated");
        Ok(updated > 0)
    }

    /// Put both stages back to pending with outputs and errors cleared
    pub fn reset_analysis_task(&self, id: i64) -> StoreResult<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE analysis_tasks SET
                stage1_status = 'pending', stage1_output_path = NULL, stage1_error = NULL,
                stage2_status = 'pending', stage2_output_path = NULL, stage2_error = NULL,
                updated_at = ?1
            WHERE id = ?2
            "#,
            params![now_text(), id],
        )?;
        Ok(updated > 0)
    }
}

struct RawAnalysis {
    id: i64,
    source_file_id: i64,
    source_filename: Option<String>,
    stage1_status: String,
    stage1_output_path: Option<String>,
    stage1_error: Option<String>,
    stage2_status: String,
    stage2_output_path: Option<String>,
    stage2_error: Option<String>,
    model_used: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawAnalysis {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_file_id: row.get(1)?,
            source_filename: row.get(2)?,
            stage1_status: row.get(3)?,
            stage1_output_path: row.get(4)?,
            stage1_error: row.get(5)?,
            stage2_status: row.get(6)?,
            stage2_output_path: row.get(7)?,
            stage2_error: row.get(8)?,
            model_used: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_analysis(self) -> StoreResult<AnalysisTask> {
        Ok(AnalysisTask {
            id: self.id,
            source_file_id: self.source_file_id,
            source_filename: self.source_filename,
            stage1_status: self.stage1_status.parse()?,
            stage1_output_path: self.stage1_output_path,
            stage1_error: self.stage1_error,
            stage2_status: self.stage2_status.parse()?,
            stage2_output_path: self.stage2_output_path,
            stage2_error: self.stage2_error,
            model_used: self.model_used,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Stage, StageStatus};

    #[test]
    fn test_create_or_get_is_idempotent() {
        let store = TaskStore::open_in_memory().unwrap();
        let first = store.create_or_get_analysis_task(7, Some("report.pdf")).unwrap();
        let second = store.create_or_get_analysis_task(7, None).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.source_filename.as_deref(), Some("report.pdf"));
        assert_eq!(first.stage1_status, StageStatus::Pending);
        assert_eq!(first.stage2_status, StageStatus::Pending);
        assert_eq!(store.get_all_analysis_tasks().unwrap().len(), 1);
    }

    #[test]
    fn test_stage_transitions_are_independent() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = store.create_or_get_analysis_task(1, None).unwrap();

        store
            .update_analysis_task(task.id, &StageUpdate::processing(Stage::One, "gemini-2.0-flash"))
            .unwrap();
        store
            .update_analysis_task(task.id, &StageUpdate::completed(Stage::One, "/tmp/stage1.json"))
            .unwrap();

        let task = store.get_analysis_task(task.id).unwrap().unwrap();
        assert_eq!(task.stage1_status, StageStatus::Completed);
        assert_eq!(task.stage1_output_path.as_deref(), Some("/tmp/stage1.json"));
        assert_eq!(task.stage2_status, StageStatus::Pending);
        assert_eq!(task.model_used.as_deref(), Some("gemini-2.0-flash"));
        assert!(task.ready_for_stage2());

        store
            .update_analysis_task(task.id, &StageUpdate::failed(Stage::Two, "quota"))
            .unwrap();
        let task = store.get_analysis_task(task.id).unwrap().unwrap();
        assert_eq!(task.stage2_status, StageStatus::Failed);
        assert_eq!(task.stage2_error.as_deref(), Some("quota"));
        assert_eq!(task.stage1_status, StageStatus::Completed);
    }

    #[test]
    fn test_reset_clears_both_stages() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = store.create_or_get_analysis_task(3, None).unwrap();
        store
            .update_analysis_task(task.id, &StageUpdate::failed(Stage::One, "boom"))
            .unwrap();

        assert!(store.reset_analysis_task(task.id).unwrap());
        let task = store.get_analysis_task(task.id).unwrap().unwrap();
        assert_eq!(task.stage1_status, StageStatus::Pending);
        assert!(task.stage1_error.is_none());
        assert!(!store.reset_analysis_task(999).unwrap());
    }
}
