//! Assignment history in the engine and the scored master recommendation.
//!
//! Each `master_assignments` row counts how often one master was given one
//! product key, how many of those tasks they completed and how long the
//! completions took on average. Recommendations score those rows:
//!
//! ```text
//! score = success_rate × 0.4 + timeliness × 0.3 + frequency × 0.2 + skill × 0.1
//!
//! timeliness = 100 - avg_minutes / 60, clamped to [0, 100]; 50 with no data
//! frequency  = min(100, 30 × ln(1 + assignments))
//! skill      = skill_level × 10
//! ```

use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::model::{
    MasterAssignment, Task, TaskStatus, UNASSIGNED, confidence_for_count, count_for_confidence,
    normalize_code,
};

use super::{Engine, Result};

/// Highest confidence a history-based recommendation may claim.
const MAX_CONFIDENCE: f64 = 95.0;

/// Confidence of a recommendation made from workload alone.
const WORKLOAD_CONFIDENCE: f64 = 30.0;

const MAX_CANDIDATES: usize = 5;
const WORKLOAD_CANDIDATES: i64 = 3;

/// A suggested master, with up to four runners-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub master_name: String,
    /// In `[0, 95]`.
    pub confidence: f64,
    pub reason: String,
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alternative {
    pub master_name: String,
    pub score: f64,
    pub reason: String,
}

struct Candidate {
    master_name: String,
    assignments: i64,
    success_rate: f64,
    score: f64,
}

fn score(success_rate: f64, avg_minutes: f64, assignments: i64, skill_level: i64) -> f64 {
    let timeliness = if avg_minutes > 0.0 {
        (100.0 - avg_minutes / 60.0).clamp(0.0, 100.0)
    } else {
        50.0
    };
    let frequency = (30.0 * (1.0 + assignments.max(0) as f64).ln()).min(100.0);
    let skill = skill_level as f64 * 10.0;
    success_rate * 0.4 + timeliness * 0.3 + frequency * 0.2 + skill * 0.1
}

fn find_row(
    conn: &Connection,
    product_name: &str,
    product_code: Option<&str>,
    master_name: &str,
) -> Result<Option<i64>> {
    let product_code = normalize_code(product_code);
    let id = conn
        .query_row(
            "SELECT id FROM master_assignments
             WHERE product_name = ?1 AND product_code IS ?2 AND master_name = ?3",
            params![product_name, product_code, master_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Counts one more assignment of a product key to a master.
fn record(
    conn: &Connection,
    product_name: &str,
    product_code: Option<&str>,
    master_name: &str,
) -> Result<()> {
    let product_code = normalize_code(product_code);
    let now = Timestamp::now().to_string();
    match find_row(conn, product_name, product_code, master_name)? {
        Some(id) => {
            conn.execute(
                "UPDATE master_assignments
                 SET assignment_count = assignment_count + 1, last_assigned_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO master_assignments
                     (product_name, product_code, master_name, assignment_count, last_assigned_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![product_name, product_code, master_name, now],
            )?;
        }
    }
    Ok(())
}

/// Folds a completed task into its assignment row's running figures.
fn record_completion(conn: &Connection, task: &Task) -> Result<()> {
    let Some(id) = find_row(
        conn,
        &task.product_name,
        task.product_code.as_deref(),
        &task.master_name,
    )?
    else {
        return Ok(());
    };
    conn.execute(
        "UPDATE master_assignments SET
             avg_completion_time =
                 (avg_completion_time * completed_count + ?2) / (completed_count + 1),
             success_rate =
                 MIN(100.0, (completed_count + 1) * 100.0 / MAX(assignment_count, 1)),
             completed_count = completed_count + 1
         WHERE id = ?1",
        params![id, task.effective_duration()],
    )?;
    Ok(())
}

/// Learns from a task save: a new real master counts as an assignment, and
/// a task reaching `completed` counts as a completion.
pub(super) fn learn_from_task(conn: &Connection, previous: Option<&Task>, task: &Task) -> Result<()> {
    if task.is_unassigned() {
        return Ok(());
    }
    let code = task.product_code.as_deref();
    if previous.is_none_or(|p| p.master_name != task.master_name) {
        record(conn, &task.product_name, code, &task.master_name)?;
    }
    let was_completed = previous.is_some_and(|p| p.status == TaskStatus::Completed);
    if task.status == TaskStatus::Completed && !was_completed {
        record_completion(conn, task)?;
    }
    Ok(())
}

/// Imports a learned record, keeping whichever count is higher.
fn write_assignment(conn: &Connection, assignment: &MasterAssignment) -> Result<()> {
    let count = count_for_confidence(assignment.confidence);
    let last = assignment.last_assigned_time.map(|t| t.to_string());
    let code = normalize_code(assignment.product_code.as_deref());
    match find_row(conn, &assignment.product_name, code, &assignment.master_name)? {
        Some(id) => {
            conn.execute(
                "UPDATE master_assignments SET
                     assignment_count = MAX(assignment_count, ?2),
                     last_assigned_at = COALESCE(?3, last_assigned_at)
                 WHERE id = ?1",
                params![id, count, last],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO master_assignments
                     (product_name, product_code, master_name, assignment_count, last_assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![assignment.product_name, code, assignment.master_name, count, last],
            )?;
        }
    }
    Ok(())
}

fn query_assignments(conn: &Connection) -> Result<Vec<MasterAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT product_name, product_code, master_name, assignment_count, last_assigned_at
         FROM master_assignments
         ORDER BY assignment_count DESC, product_name, master_name",
    )?;
    let rows = stmt.query_map([], |row| {
        let last: Option<String> = row.get(4)?;
        Ok(MasterAssignment {
            product_name: row.get(0)?,
            product_code: row.get(1)?,
            master_name: row.get(2)?,
            confidence: confidence_for_count(row.get(3)?),
            last_assigned_time: last.and_then(|s| s.parse().ok()),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

impl Engine {
    /// Counts one assignment of a product key to a master, then persists.
    pub fn record_assignment(
        &mut self,
        product_name: &str,
        product_code: Option<&str>,
        master_name: &str,
    ) -> Result<()> {
        let result =
            self.in_transaction(|conn| record(conn, product_name, product_code, master_name));
        self.logged("record_assignment", result)?;
        self.persist()
    }

    /// Stores a learned record, then persists.
    pub fn upsert_assignment(&mut self, assignment: &MasterAssignment) -> Result<()> {
        let result = self.in_transaction(|conn| write_assignment(conn, assignment));
        self.logged("upsert_assignment", result)?;
        self.persist()
    }

    /// Stores many learned records in one transaction, then persists once.
    pub fn upsert_assignments(&mut self, assignments: &[MasterAssignment]) -> Result<usize> {
        let result = self.in_transaction(|conn| {
            assignments
                .iter()
                .try_for_each(|a| write_assignment(conn, a))
        });
        self.logged("upsert_assignments", result)?;
        self.persist()?;
        Ok(assignments.len())
    }

    /// Every assignment row as a learned record, strongest first.
    pub fn assignments(&self) -> Result<Vec<MasterAssignment>> {
        self.logged("assignments", query_assignments(&self.conn))
    }

    /// Suggests a master for a product.
    ///
    /// With a code, only history for that code counts; without one, history
    /// for every code of the product does. With no history at all, the
    /// active master with the fewest open tasks wins (higher skill breaks
    /// ties) at a fixed 30% confidence.
    pub fn recommend_worker(
        &self,
        product_name: &str,
        product_code: Option<&str>,
    ) -> Result<Recommendation> {
        let result = self.scored_candidates(product_name, product_code);
        let candidates = self.logged("recommend_worker", result)?;

        if let Some((best, rest)) = candidates.split_first() {
            return Ok(Recommendation {
                master_name: best.master_name.clone(),
                confidence: best.score.min(MAX_CONFIDENCE),
                reason: format!(
                    "{} past assignments, {:.1}% success rate",
                    best.assignments, best.success_rate
                ),
                alternatives: rest
                    .iter()
                    .map(|c| Alternative {
                        master_name: c.master_name.clone(),
                        score: c.score,
                        reason: format!(
                            "{} past assignments, {:.1}% success rate",
                            c.assignments, c.success_rate
                        ),
                    })
                    .collect(),
            });
        }

        let result = self.least_loaded();
        let loads = self.logged("recommend_worker", result)?;
        let Some(((name, open), rest)) = loads.split_first() else {
            return Ok(Recommendation {
                master_name: UNASSIGNED.to_string(),
                confidence: 0.0,
                reason: "no active masters".into(),
                alternatives: Vec::new(),
            });
        };
        Ok(Recommendation {
            master_name: name.clone(),
            confidence: WORKLOAD_CONFIDENCE,
            reason: format!("lightest current workload ({open} open tasks)"),
            alternatives: rest
                .iter()
                .map(|(name, open)| Alternative {
                    master_name: name.clone(),
                    score: WORKLOAD_CONFIDENCE - *open as f64,
                    reason: format!("light workload ({open} open tasks)"),
                })
                .collect(),
        })
    }

    fn scored_candidates(
        &self,
        product_name: &str,
        product_code: Option<&str>,
    ) -> Result<Vec<Candidate>> {
        let product_code = normalize_code(product_code);
        let mut stmt = self.conn.prepare(
            "SELECT ma.master_name,
                    SUM(ma.assignment_count),
                    AVG(ma.success_rate),
                    AVG(ma.avg_completion_time),
                    m.skill_level
             FROM master_assignments ma
             JOIN masters m ON ma.master_name = m.name
             WHERE ma.product_name = ?1
               AND (?2 IS NULL OR ma.product_code = ?2)
               AND m.active = 1
             GROUP BY ma.master_name, m.skill_level",
        )?;
        let mut candidates = stmt
            .query_map(params![product_name, product_code], |row| {
                let master_name: String = row.get(0)?;
                let assignments: i64 = row.get(1)?;
                let success_rate: f64 = row.get(2)?;
                let avg_minutes: f64 = row.get(3)?;
                let skill_level: i64 = row.get(4)?;
                Ok(Candidate {
                    master_name,
                    assignments,
                    success_rate,
                    score: score(success_rate, avg_minutes, assignments, skill_level),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.master_name.cmp(&b.master_name))
        });
        candidates.truncate(MAX_CANDIDATES);
        Ok(candidates)
    }

    /// Active masters by open (not completed) task count, fewest first.
    fn least_loaded(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.name,
                    (SELECT COUNT(*) FROM tasks t
                     WHERE t.master_name = m.name AND t.status != 'completed') AS open
             FROM masters m
             WHERE m.active = 1
             ORDER BY open ASC, m.skill_level DESC, m.name ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![WORKLOAD_CANDIDATES], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
