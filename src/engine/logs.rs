//! Best-effort system log kept inside the database.
//!
//! Writing a log row never fails the caller: a failed write is reported
//! through `tracing` and otherwise dropped.

use jiff::Timestamp;
use rusqlite::params;
use serde::Serialize;
use tracing::debug;

use super::{Engine, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: String,
}

impl Engine {
    /// Appends a row to `system_logs`.
    pub fn log_event(&self, level: &str, message: &str, details: Option<serde_json::Value>) {
        let details = details.map(|d| d.to_string());
        let written = self.conn.execute(
            "INSERT INTO system_logs (level, message, details, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![level, message, details, Timestamp::now().to_string()],
        );
        if let Err(e) = written {
            debug!(error = %e, message, "system log write dropped");
        }
    }

    /// Logs a failed operation at `error` level.
    pub fn log_error(&self, operation: &str, message: &str, details: Option<serde_json::Value>) {
        let mut all = serde_json::json!({ "operation": operation });
        if let Some(details) = details {
            all["details"] = details;
        }
        self.log_event("error", message, Some(all));
    }

    /// The most recent `limit` log rows, newest first.
    pub fn recent_logs(&self, limit: u32) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT level, message, details, created_at
             FROM system_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let details: Option<String> = row.get(2)?;
            Ok(LogEntry {
                level: row.get(0)?,
                message: row.get(1)?,
                details: details.and_then(|d| serde_json::from_str(&d).ok()),
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::tests::test_engine;
    use crate::engine::{Engine, EngineError};
    use crate::model::{default_roster, sample_task};

    #[test]
    fn first_initialization_is_logged() {
        let (_store, engine) = test_engine();
        let logs = engine.recent_logs(10).unwrap();

        assert!(logs.iter().any(|l| l.message == "database initialized"));
    }

    #[test]
    fn failed_operations_leave_an_error_row() {
        let (_store, mut engine) = test_engine();
        let mut task = sample_task("t1");
        task.work_hours = -5.0;

        assert!(matches!(
            engine.upsert_task(&task),
            Err(EngineError::InvalidTask { .. })
        ));

        let latest = &engine.recent_logs(1).unwrap()[0];
        assert_eq!(latest.level, "error");
        assert_eq!(latest.details.as_ref().unwrap()["operation"], "upsert_task");
    }

    #[test]
    fn failure_rows_survive_a_reload() {
        let (store, engine) = test_engine();
        engine.conn.execute_batch("DROP TABLE task_history").unwrap();

        assert!(engine.task_history("t1").is_err());

        let mut reloaded = Engine::open(Some(store), default_roster()).unwrap();
        reloaded.load_from_store().unwrap();
        let latest = &reloaded.recent_logs(1).unwrap()[0];
        assert_eq!(latest.level, "error");
        assert_eq!(latest.details.as_ref().unwrap()["operation"], "task_history");
    }

    #[test]
    fn read_failures_are_logged_too() {
        let (_store, engine) = test_engine();
        engine.conn.execute_batch("DROP TABLE tasks").unwrap();

        assert!(engine.count_tasks().is_err());

        let latest = &engine.recent_logs(1).unwrap()[0];
        assert_eq!(latest.details.as_ref().unwrap()["operation"], "count_tasks");
    }

    #[test]
    fn logging_before_initialization_is_swallowed() {
        let engine = Engine::open(None, default_roster()).unwrap();
        // No tables yet: the write fails quietly.
        engine.log_event("info", "too early", None);
        assert!(engine.recent_logs(1).is_err());
    }
}
