//! The roster table and its running totals.

use rusqlite::{Connection, params};

use crate::model::Master;

use super::{Engine, Result};

/// Recounts total and completed tasks for one master.
///
/// Names not on the roster (the unassigned sentinel included) are ignored.
pub(super) fn refresh_stats(conn: &Connection, master_name: &str) -> Result<()> {
    conn.execute(
        "UPDATE masters SET
             total_tasks = (SELECT COUNT(*) FROM tasks WHERE master_name = ?1),
             completed_tasks = (SELECT COUNT(*) FROM tasks
                                WHERE master_name = ?1 AND status = 'completed'),
             updated_at = CURRENT_TIMESTAMP
         WHERE name = ?1",
        params![master_name],
    )?;
    Ok(())
}

impl Engine {
    /// The roster, by name.
    pub fn masters(&self) -> Result<Vec<Master>> {
        self.logged("masters", query_masters(&self.conn))
    }
}

fn query_masters(conn: &Connection) -> Result<Vec<Master>> {
    let mut stmt = conn.prepare(
        "SELECT name, skill_level, active, total_tasks, completed_tasks
         FROM masters ORDER BY name",
    )?;
    let masters = stmt
        .query_map([], |row| {
            Ok(Master {
                name: row.get(0)?,
                skill_level: row.get(1)?,
                active: row.get(2)?,
                total_tasks: row.get(3)?,
                completed_tasks: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(masters)
}

#[cfg(test)]
mod tests {
    use crate::engine::tests::test_engine;
    use crate::model::{Master, TaskStatus, sample_task};

    fn master(masters: &[Master], name: &str) -> (i64, i64) {
        let m = masters.iter().find(|m| m.name == name).unwrap();
        (m.total_tasks, m.completed_tasks)
    }

    #[test]
    fn totals_follow_task_saves() {
        let (_store, mut engine) = test_engine();
        let mut a = sample_task("a");
        a.master_name = "Li Xue".into();
        let mut b = sample_task("b");
        b.master_name = "Li Xue".into();
        b.status = TaskStatus::Completed;
        engine.upsert_tasks_batch(&[a, b]).unwrap();

        assert_eq!(master(&engine.masters().unwrap(), "Li Xue"), (2, 1));
    }

    #[test]
    fn reassignment_updates_both_masters() {
        let (_store, mut engine) = test_engine();
        let mut task = sample_task("a");
        task.master_name = "Li Xue".into();
        engine.upsert_task(&task).unwrap();
        task.master_name = "Zhou Bo".into();
        engine.upsert_task(&task).unwrap();

        let masters = engine.masters().unwrap();
        assert_eq!(master(&masters, "Li Xue"), (0, 0));
        assert_eq!(master(&masters, "Zhou Bo"), (1, 0));
    }

    #[test]
    fn deleting_a_task_decrements_its_master() {
        let (_store, mut engine) = test_engine();
        let mut task = sample_task("a");
        task.master_name = "Li Xue".into();
        engine.upsert_task(&task).unwrap();
        engine.delete_task("a").unwrap();

        assert_eq!(master(&engine.masters().unwrap(), "Li Xue"), (0, 0));
    }
}
