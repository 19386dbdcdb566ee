use rusqlite::params_from_iter;

use crate::domain::{LogFilter, LogRecord, NewLogRecord};

use super::{now_text, parse_timestamp, timestamp_text, StoreResult, TaskStore};

impl TaskStore {
    /// Append log records in one transaction. Levels are stored upper-cased.
    pub fn add_system_logs(&mut self, records: &[NewLogRecord]) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO system_logs (timestamp, source, level, message) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in records {
                let timestamp = record.timestamp.map(timestamp_text).unwrap_or_else(now_text);
                stmt.execute(rusqlite::params![
                    timestamp,
                    record.source,
                    record.level.to_uppercase(),
                    record.message
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Logs matching every non-empty filter, oldest first
    pub fn get_system_logs(&self, filter: &LogFilter) -> StoreResult<Vec<LogRecord>> {
        let mut sql = String::from("SELECT timestamp, source, level, message FROM system_logs");
        let mut conditions = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if !filter.levels.is_empty() {
            conditions.push(format!("level IN ({})", placeholders(filter.levels.len())));
            values.extend(filter.levels.iter().map(|l| l.to_uppercase()));
        }
        if !filter.sources.is_empty() {
            conditions.push(format!("source IN ({})", placeholders(filter.sources.len())));
            values.extend(filter.sources.iter().cloned());
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(timestamp, source, level, message)| {
                Ok(LogRecord {
                    timestamp: parse_timestamp("timestamp", &timestamp)?,
                    source,
                    level,
                    message,
                })
            })
            .collect()
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}
