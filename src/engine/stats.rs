//! Production statistics over the task table.

use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;
use serde::Serialize;

use crate::model::{LEGACY_UNASSIGNED, UNASSIGNED};

use super::{DateRange, Engine, Result};

/// Duration of a task with its coefficient and quantity applied.
const EFFECTIVE_DURATION: &str = "work_hours * COALESCE(coefficient, 1) * COALESCE(quantity, 1)";

/// Number of most recent days in the daily series.
const DAILY_WINDOW: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub pending_tasks: i64,
    pub in_progress_tasks: i64,
    /// Mean effective duration of completed tasks, in minutes; 0 with none.
    pub avg_completion_time: f64,
    pub master_productivity: Vec<MasterProductivity>,
    /// Newest day first.
    pub daily_progress: Vec<DailyProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterProductivity {
    pub master_name: String,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub avg_work_hours: f64,
    /// Completion rate, in percent.
    pub efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyProgress {
    pub date: String,
    pub completed: i64,
    pub total: i64,
    pub percentage: f64,
}

impl Engine {
    /// Aggregates over all tasks, or those whose commit time falls in `range`.
    pub fn get_statistics(&self, range: Option<&DateRange>) -> Result<Statistics> {
        let result = self.statistics(range);
        self.logged("get_statistics", result)
    }

    fn statistics(&self, range: Option<&DateRange>) -> Result<Statistics> {
        let mut clauses = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(range) = range {
            params.push(range.start.clone().into());
            params.push(range.end.clone().into());
            clauses.push("commit_time BETWEEN ?1 AND ?2".to_string());
        }
        let where_all = where_clause(&clauses);

        let (total_tasks, completed_tasks, pending_tasks, in_progress_tasks, avg_completion_time) =
            self.conn.query_row(
                &format!(
                    "SELECT COUNT(*),
                            COALESCE(SUM(status = 'completed'), 0),
                            COALESCE(SUM(status = 'pending'), 0),
                            COALESCE(SUM(status = 'in-progress'), 0),
                            COALESCE(AVG(CASE WHEN status = 'completed'
                                         THEN {EFFECTIVE_DURATION} END), 0)
                     FROM tasks {where_all}"
                ),
                params_from_iter(params.iter()),
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                },
            )?;

        let mut master_params = params.clone();
        master_params.push(UNASSIGNED.to_string().into());
        master_params.push(LEGACY_UNASSIGNED.to_string().into());
        let mut master_clauses = clauses.clone();
        master_clauses.push(format!(
            "master_name NOT IN (?{}, ?{})",
            master_params.len() - 1,
            master_params.len()
        ));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT master_name,
                    COUNT(*),
                    SUM(status = 'completed'),
                    AVG({EFFECTIVE_DURATION}),
                    SUM(status = 'completed') * 100.0 / COUNT(*) AS efficiency
             FROM tasks {}
             GROUP BY master_name
             ORDER BY efficiency DESC, 3 DESC, master_name",
            where_clause(&master_clauses)
        ))?;
        let master_productivity = stmt
            .query_map(params_from_iter(master_params.iter()), |row| {
                Ok(MasterProductivity {
                    master_name: row.get(0)?,
                    total_tasks: row.get(1)?,
                    completed_tasks: row.get(2)?,
                    avg_work_hours: row.get(3)?,
                    efficiency: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut daily_clauses = clauses;
        daily_clauses.push("DATE(commit_time) IS NOT NULL".to_string());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DATE(commit_time) AS day,
                    SUM(status = 'completed'),
                    COUNT(*),
                    SUM(status = 'completed') * 100.0 / COUNT(*)
             FROM tasks {}
             GROUP BY day
             ORDER BY day DESC
             LIMIT {DAILY_WINDOW}",
            where_clause(&daily_clauses)
        ))?;
        let daily_progress = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok(DailyProgress {
                    date: row.get(0)?,
                    completed: row.get(1)?,
                    total: row.get(2)?,
                    percentage: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Statistics {
            total_tasks,
            completed_tasks,
            pending_tasks,
            in_progress_tasks,
            avg_completion_time,
            master_productivity,
            daily_progress,
        })
    }
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}
