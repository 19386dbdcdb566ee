use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{now_text, StoreResult, TaskStore};

impl TaskStore {
    /// Upsert a key (last write wins)
    pub fn set_app_state(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.conn.execute(
            r#"
            INSERT INTO app_state (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, now_text()],
        )?;
        info!(key, "App state updated");
        Ok(true)
    }

    pub fn get_app_state(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    pub fn get_all_app_states(&self) -> StoreResult<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM app_state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_last_write_wins() {
        let store = TaskStore::open_in_memory().unwrap();
        assert!(store.get_app_state("http_port").unwrap().is_none());

        store.set_app_state("http_port", "8000").unwrap();
        store.set_app_state("http_port", "8123").unwrap();
        store.set_app_state("theme", "dark").unwrap();

        assert_eq!(store.get_app_state("http_port").unwrap().as_deref(), Some("8123"));
        let all = store.get_all_app_states().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["theme"], "dark");
    }
}
