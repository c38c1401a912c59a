//! Task storage: upserts with history, paging, deletion.

use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use rusqlite::types::{Type, Value as SqlValue};
use serde::Serialize;
use tracing::debug;

use crate::model::{
    LEGACY_UNASSIGNED, Task, TaskStatus, UNASSIGNED, is_unassigned, normalize_code,
};

use super::{Engine, EngineError, Result, RowWriteError, assignments, masters};

const TASK_COLUMNS: &str = "id, product_name, product_code, work_hours, coefficient, \
     master_name, batch_number, client_name, commit_time, status, priority, \
     process_order_id, factory_code, order_date, delivery_time, quantity, \
     assigned_person, assigned_team";

/// Newest-first board order, with a deterministic final tie-break.
const TASK_ORDER: &str = "priority DESC, commit_time DESC, created_at DESC, rowid DESC";

/// Inclusive range over the free-form commit time strings, compared lexically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

impl DateRange {
    pub fn contains(&self, commit_time: &str) -> bool {
        self.start.as_str() <= commit_time && commit_time <= self.end.as_str()
    }
}

/// Optional constraints on a task listing. The default matches everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub master_name: Option<String>,
    /// Matched case-insensitively against product name, batch and client.
    pub search: Option<String>,
    pub date_range: Option<DateRange>,
    pub min_priority: Option<i64>,
}

impl TaskFilter {
    /// The same test the SQL listing applies, for in-memory task lists.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status
            && task.status != status
        {
            return false;
        }
        if let Some(master) = &self.master_name {
            let same = if is_unassigned(master) {
                task.is_unassigned()
            } else {
                &task.master_name == master
            };
            if !same {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = [&task.product_name, &task.batch_number, &task.client_name]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        if let Some(range) = &self.date_range
            && !range.contains(&task.commit_time)
        {
            return false;
        }
        if let Some(min) = self.min_priority
            && task.priority < min
        {
            return false;
        }
        true
    }

    /// SQL `WHERE` clause (empty when unfiltered) and its parameters.
    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(status) = self.status {
            params.push(status.as_str().to_string().into());
            clauses.push(format!("status = ?{}", params.len()));
        }
        if let Some(master) = &self.master_name {
            if is_unassigned(master) {
                params.push(UNASSIGNED.to_string().into());
                params.push(LEGACY_UNASSIGNED.to_string().into());
                clauses.push(format!(
                    "master_name IN (?{}, ?{})",
                    params.len() - 1,
                    params.len()
                ));
            } else {
                params.push(master.clone().into());
                clauses.push(format!("master_name = ?{}", params.len()));
            }
        }
        if let Some(search) = &self.search {
            params.push(format!("%{}%", escape_like(search)).into());
            let n = params.len();
            clauses.push(format!(
                "(product_name LIKE ?{n} ESCAPE '\\' \
                 OR batch_number LIKE ?{n} ESCAPE '\\' \
                 OR client_name LIKE ?{n} ESCAPE '\\')"
            ));
        }
        if let Some(range) = &self.date_range {
            params.push(range.start.clone().into());
            params.push(range.end.clone().into());
            clauses.push(format!(
                "commit_time BETWEEN ?{} AND ?{}",
                params.len() - 1,
                params.len()
            ));
        }
        if let Some(min) = self.min_priority {
            params.push(min.into());
            clauses.push(format!("priority >= ?{}", params.len()));
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), params)
        }
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// One page of an ordered listing. Pages are numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Task>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

impl Page {
    /// Cuts a page out of an already filtered and ordered list.
    pub fn slice(tasks: Vec<Task>, page: u32, page_size: u32) -> Self {
        let (page, page_size) = (page.max(1), page_size.max(1));
        let total = tasks.len();
        let offset = (page as usize - 1).saturating_mul(page_size as usize);
        let items: Vec<Task> = tasks
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();
        let has_more = offset + items.len() < total;
        Self {
            items,
            total,
            page,
            page_size,
            has_more,
        }
    }
}

/// Result of a batch upsert: how many rows landed and which did not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub written: usize,
    pub errors: Vec<RowWriteError>,
}

/// A row of `task_history`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub task_id: String,
    /// `created`, `updated` or `deleted`.
    pub action: String,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub changed_by: String,
    pub created_at: String,
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(9)?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, e.into()))?;
    Ok(Task {
        id: row.get(0)?,
        product_name: row.get(1)?,
        product_code: row.get(2)?,
        work_hours: row.get(3)?,
        coefficient: row.get(4)?,
        master_name: row.get(5)?,
        batch_number: row.get(6)?,
        client_name: row.get(7)?,
        commit_time: row.get(8)?,
        status,
        priority: row.get(10)?,
        process_order_id: row.get(11)?,
        factory_code: row.get(12)?,
        order_date: row.get(13)?,
        delivery_time: row.get(14)?,
        quantity: row.get(15)?,
        assigned_person: row.get(16)?,
        assigned_team: row.get(17)?,
    })
}

pub(super) fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

fn record_history(
    conn: &Connection,
    task_id: &str,
    action: &str,
    old: Option<&Task>,
    new: Option<&Task>,
) -> Result<()> {
    let old = old.map(serde_json::to_string).transpose()?;
    let new = new.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO task_history (task_id, action, old_values, new_values, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id, action, old, new, Timestamp::now().to_string()],
    )?;
    Ok(())
}

/// Writes one task with its history, master totals and learned assignment.
///
/// Returns the row it replaced, if any.
fn write_task(conn: &Connection, task: &Task, now_ms: i64) -> Result<Option<Task>> {
    task.validate().map_err(|reason| EngineError::InvalidTask {
        id: task.id.clone(),
        reason,
    })?;
    let previous = load_task(conn, &task.id)?;

    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20)
             ON CONFLICT(id) DO UPDATE SET
                 product_name = excluded.product_name,
                 product_code = excluded.product_code,
                 work_hours = excluded.work_hours,
                 coefficient = excluded.coefficient,
                 master_name = excluded.master_name,
                 batch_number = excluded.batch_number,
                 client_name = excluded.client_name,
                 commit_time = excluded.commit_time,
                 status = excluded.status,
                 priority = excluded.priority,
                 process_order_id = excluded.process_order_id,
                 factory_code = excluded.factory_code,
                 order_date = excluded.order_date,
                 delivery_time = excluded.delivery_time,
                 quantity = excluded.quantity,
                 assigned_person = excluded.assigned_person,
                 assigned_team = excluded.assigned_team,
                 updated_at = excluded.updated_at"
        ),
        params![
            task.id,
            task.product_name,
            normalize_code(task.product_code.as_deref()),
            task.work_hours,
            task.coefficient,
            task.master_name,
            task.batch_number,
            task.client_name,
            task.commit_time,
            task.status.as_str(),
            task.priority,
            task.process_order_id,
            task.factory_code,
            task.order_date,
            task.delivery_time,
            task.quantity,
            task.assigned_person,
            task.assigned_team,
            now_ms,
            Timestamp::now().to_string(),
        ],
    )?;

    let action = if previous.is_some() { "updated" } else { "created" };
    record_history(conn, &task.id, action, previous.as_ref(), Some(task))?;

    masters::refresh_stats(conn, &task.master_name)?;
    if let Some(prev) = &previous
        && prev.master_name != task.master_name
    {
        masters::refresh_stats(conn, &prev.master_name)?;
    }
    assignments::learn_from_task(conn, previous.as_ref(), task)?;

    Ok(previous)
}

/// One batch row inside its own savepoint, so a failing row leaves nothing behind.
fn write_row(tx: &mut Transaction<'_>, task: &Task, now_ms: i64) -> Result<()> {
    let sp = tx.savepoint()?;
    write_task(&sp, task, now_ms)?;
    sp.commit()?;
    Ok(())
}

impl Engine {
    /// Inserts or replaces a task by id, then persists.
    ///
    /// Creation time survives replacement, so board order stays stable.
    pub fn upsert_task(&mut self, task: &Task) -> Result<()> {
        let now_ms = Timestamp::now().as_millisecond();
        let result = self.in_transaction(|conn| write_task(conn, task, now_ms).map(drop));
        self.logged("upsert_task", result)?;
        self.persist()
    }

    /// Writes every valid task in one transaction and persists once.
    ///
    /// A row that fails is skipped and reported in the outcome; the rest of
    /// the batch still commits. Only a failure to begin or commit the
    /// transaction fails the call.
    pub fn upsert_tasks_batch(&mut self, tasks: &[Task]) -> Result<BatchOutcome> {
        let now_ms = Timestamp::now().as_millisecond();
        let mut outcome = BatchOutcome::default();

        let result = (|| {
            let mut tx = self
                .conn
                .transaction()
                .map_err(|e| EngineError::Transaction(e.to_string()))?;
            for task in tasks {
                match write_row(&mut tx, task, now_ms) {
                    Ok(()) => outcome.written += 1,
                    Err(e) => outcome.errors.push(RowWriteError {
                        task_id: task.id.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
            tx.commit()
                .map_err(|e| EngineError::Transaction(e.to_string()))
        })();
        self.logged("upsert_tasks_batch", result)?;

        debug!(
            written = outcome.written,
            failed = outcome.errors.len(),
            "batch upsert committed"
        );
        let first_errors: Vec<&RowWriteError> = outcome.errors.iter().take(10).collect();
        self.log_event(
            "info",
            "batch task save finished",
            Some(serde_json::json!({
                "totalTasks": tasks.len(),
                "successCount": outcome.written,
                "failedCount": outcome.errors.len(),
                "errors": first_errors,
            })),
        );
        self.persist()?;
        Ok(outcome)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.logged("get_task", load_task(&self.conn, id))
    }

    /// One page of tasks in board order.
    ///
    /// `page` and `page_size` below 1 are treated as 1.
    pub fn get_page(&self, page: u32, page_size: u32, filter: &TaskFilter) -> Result<Page> {
        let result = query_page(&self.conn, page.max(1), page_size.max(1), filter);
        self.logged("get_page", result)
    }

    /// Every task in board order.
    pub fn all_tasks(&self) -> Result<Vec<Task>> {
        self.logged("all_tasks", query_all(&self.conn))
    }

    pub fn count_tasks(&self) -> Result<usize> {
        let result = self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get::<_, i64>(0))
            .map_err(EngineError::from);
        let count = self.logged("count_tasks", result)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Removes a task, keeping a `deleted` history entry with its last
    /// snapshot. Returns whether anything was removed; a missing id is a no-op.
    pub fn delete_task(&mut self, id: &str) -> Result<bool> {
        let result = self.in_transaction(|conn| {
            let Some(previous) = load_task(conn, id)? else {
                return Ok(false);
            };
            record_history(conn, id, "deleted", Some(&previous), None)?;
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            masters::refresh_stats(conn, &previous.master_name)?;
            Ok(true)
        });
        let deleted = self.logged("delete_task", result)?;
        if deleted {
            self.persist()?;
        }
        Ok(deleted)
    }

    /// History of one task, oldest first. Survives deletion of the task.
    pub fn task_history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        self.logged("task_history", query_history(&self.conn, id))
    }
}

fn query_page(conn: &Connection, page: u32, page_size: u32, filter: &TaskFilter) -> Result<Page> {
    let (where_clause, mut params) = filter.to_sql();

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM tasks {where_clause}"),
        params_from_iter(params.iter()),
        |row| row.get(0),
    )?;

    let offset = i64::from(page - 1) * i64::from(page_size);
    params.push(i64::from(page_size).into());
    params.push(offset.into());
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks {where_clause}
         ORDER BY {TASK_ORDER}
         LIMIT ?{} OFFSET ?{}",
        params.len() - 1,
        params.len()
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(params.iter()), task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let total = usize::try_from(total).unwrap_or(0);
    let has_more = usize::try_from(offset).unwrap_or(usize::MAX).saturating_add(items.len()) < total;
    Ok(Page {
        items,
        total,
        page,
        page_size,
        has_more,
    })
}

fn query_all(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY {TASK_ORDER}"))?;
    let tasks = stmt
        .query_map([], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

fn query_history(conn: &Connection, id: &str) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, action, old_values, new_values, changed_by, created_at
         FROM task_history WHERE task_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        let old: Option<String> = row.get(2)?;
        let new: Option<String> = row.get(3)?;
        Ok(HistoryEntry {
            task_id: row.get(0)?,
            action: row.get(1)?,
            old_values: old.and_then(|s| serde_json::from_str(&s).ok()),
            new_values: new.and_then(|s| serde_json::from_str(&s).ok()),
            changed_by: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::tests::test_engine;
    use crate::model::sample_task;

    fn task_with(id: &str, priority: i64, commit_time: &str) -> Task {
        Task {
            priority,
            commit_time: commit_time.into(),
            ..sample_task(id)
        }
    }

    #[test]
    fn saving_twice_keeps_one_row_and_logs_an_update() {
        let (_store, mut engine) = test_engine();
        let task = sample_task("t1");

        engine.upsert_task(&task).unwrap();
        engine.upsert_task(&task).unwrap();

        assert_eq!(engine.count_tasks().unwrap(), 1);
        let actions: Vec<String> = engine
            .task_history("t1")
            .unwrap()
            .into_iter()
            .map(|h| h.action)
            .collect();
        assert_eq!(actions, vec!["created", "updated"]);
    }

    #[test]
    fn update_history_carries_old_and_new_snapshots() {
        let (_store, mut engine) = test_engine();
        let mut task = sample_task("t1");
        engine.upsert_task(&task).unwrap();
        task.priority = 9;
        engine.upsert_task(&task).unwrap();

        let history = engine.task_history("t1").unwrap();
        let update = &history[1];
        assert_eq!(update.old_values.as_ref().unwrap()["priority"], 5);
        assert_eq!(update.new_values.as_ref().unwrap()["priority"], 9);
    }

    #[test]
    fn invalid_task_is_rejected() {
        let (_store, mut engine) = test_engine();
        let mut task = sample_task("t1");
        task.work_hours = 0.0;

        let err = engine.upsert_task(&task).unwrap_err();

        assert!(matches!(err, EngineError::InvalidTask { .. }));
        assert_eq!(engine.count_tasks().unwrap(), 0);
    }

    #[test]
    fn batch_skips_bad_rows_and_commits_the_rest() {
        let (_store, mut engine) = test_engine();
        let mut tasks: Vec<Task> = (0..5).map(|i| sample_task(&format!("t{i}"))).collect();
        tasks[2].work_hours = -1.0;

        let outcome = engine.upsert_tasks_batch(&tasks).unwrap();

        assert_eq!(outcome.written, 4);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].task_id, "t2");
        assert_eq!(engine.count_tasks().unwrap(), 4);
        assert!(engine.task_history("t2").unwrap().is_empty());
    }

    #[test]
    fn page_order_is_priority_then_commit_then_creation() {
        let (_store, mut engine) = test_engine();
        engine
            .upsert_tasks_batch(&[
                task_with("low", 1, "2025-01-20"),
                task_with("old", 5, "2025-01-01"),
                task_with("new", 5, "2025-01-10"),
                task_with("urgent", 9, "2024-12-01"),
                task_with("new-later", 5, "2025-01-10"),
            ])
            .unwrap();

        let page = engine.get_page(1, 10, &TaskFilter::default()).unwrap();
        let ids: Vec<&str> = page.items.iter().map(|t| t.id.as_str()).collect();

        assert_eq!(ids, vec!["urgent", "new-later", "new", "old", "low"]);
        let again = engine.get_page(1, 10, &TaskFilter::default()).unwrap();
        assert_eq!(page, again);
    }

    #[test]
    fn paging_reports_total_and_has_more() {
        let (_store, mut engine) = test_engine();
        let tasks: Vec<Task> = (0..5).map(|i| sample_task(&format!("t{i}"))).collect();
        engine.upsert_tasks_batch(&tasks).unwrap();

        let first = engine.get_page(1, 2, &TaskFilter::default()).unwrap();
        let last = engine.get_page(3, 2, &TaskFilter::default()).unwrap();
        let zero = engine.get_page(0, 0, &TaskFilter::default()).unwrap();

        assert_eq!(first.total, 5);
        assert!(first.has_more);
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
        assert_eq!((zero.page, zero.page_size, zero.items.len()), (1, 1, 1));
    }

    #[test]
    fn filters_narrow_the_page() {
        let (_store, mut engine) = test_engine();
        let mut done = task_with("done", 8, "2025-02-01");
        done.status = TaskStatus::Completed;
        done.master_name = "Li Xue".into();
        done.client_name = "Harbor Works".into();
        let mut pct = task_with("pct", 2, "2025-03-01");
        pct.batch_number = "100%_LOT".into();
        engine
            .upsert_tasks_batch(&[done, pct, task_with("plain", 3, "2025-01-05")])
            .unwrap();

        let by = |filter: TaskFilter| -> Vec<String> {
            engine
                .get_page(1, 10, &filter)
                .unwrap()
                .items
                .into_iter()
                .map(|t| t.id)
                .collect()
        };

        assert_eq!(
            by(TaskFilter {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            }),
            vec!["done"]
        );
        assert_eq!(
            by(TaskFilter {
                master_name: Some("Li Xue".into()),
                ..Default::default()
            }),
            vec!["done"]
        );
        assert_eq!(
            by(TaskFilter {
                master_name: Some(UNASSIGNED.into()),
                ..Default::default()
            }),
            vec!["plain", "pct"]
        );
        assert_eq!(
            by(TaskFilter {
                search: Some("harbor".into()),
                ..Default::default()
            }),
            vec!["done"]
        );
        assert_eq!(
            by(TaskFilter {
                search: Some("0%_".into()),
                ..Default::default()
            }),
            vec!["pct"]
        );
        assert_eq!(
            by(TaskFilter {
                min_priority: Some(3),
                ..Default::default()
            }),
            vec!["done", "plain"]
        );
        assert_eq!(
            by(TaskFilter {
                date_range: Some(DateRange {
                    start: "2025-01-01".into(),
                    end: "2025-02-28".into(),
                }),
                ..Default::default()
            }),
            vec!["done", "plain"]
        );
    }

    #[test]
    fn in_memory_filter_agrees_with_sql() {
        let mut task = sample_task("t1");
        task.client_name = "Harbor Works".into();
        task.master_name = LEGACY_UNASSIGNED.into();

        let filter = TaskFilter {
            search: Some("HARBOR".into()),
            master_name: Some(UNASSIGNED.into()),
            min_priority: Some(5),
            ..Default::default()
        };
        assert!(filter.matches(&task));

        task.priority = 4;
        assert!(!filter.matches(&task));
    }

    #[test]
    fn delete_keeps_history_and_missing_id_is_a_noop() {
        let (_store, mut engine) = test_engine();
        engine.upsert_task(&sample_task("t1")).unwrap();

        assert!(engine.delete_task("t1").unwrap());
        assert!(!engine.delete_task("t1").unwrap());
        assert!(!engine.delete_task("never-existed").unwrap());

        assert!(engine.get_task("t1").unwrap().is_none());
        let history = engine.task_history("t1").unwrap();
        assert_eq!(history.last().unwrap().action, "deleted");
        assert_eq!(
            history.last().unwrap().old_values.as_ref().unwrap()["id"],
            "t1"
        );
    }

    #[test]
    fn page_slice_matches_sql_paging() {
        let tasks: Vec<Task> = (0..5).map(|i| sample_task(&format!("t{i}"))).collect();

        let page = Page::slice(tasks, 2, 2);

        assert_eq!(page.total, 5);
        assert_eq!(page.items[0].id, "t2");
        assert!(page.has_more);
    }
}
