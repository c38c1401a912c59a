//! Assignment recommender: turns manual assignments into import defaults.
//!
//! The learned list lives in the key-value store under
//! [`keys::MASTER_ASSIGNMENTS`], one record per product key. Matching is
//! exact: a product name plus the presence and value of its code. A record
//! without a code only recommends once its confidence exceeds 0.8. The
//! recommender never guesses from partial matches, and never overrides a
//! master the user picked.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use jiff::Timestamp;
use serde::Serialize;
use tracing::debug;

use crate::kv::{KvStore, Result, keys};
use crate::model::{
    CONFIDENCE_STEP, INITIAL_CONFIDENCE, MasterAssignment, Task, UNASSIGNED, is_unassigned,
    normalize_code,
};

/// Confidence an uncoded record needs before it recommends anyone.
pub const NAME_ONLY_THRESHOLD: f64 = 0.8;

/// Default cut-off for [`Recommender::prune_below`].
pub const DEFAULT_PRUNE_THRESHOLD: f64 = 0.3;

/// How a set of tasks came by their masters.
///
/// `auto_assigned + manual == total` and
/// `by_product_code + by_product_name == auto_assigned`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentStats {
    pub total: usize,
    pub auto_assigned: usize,
    pub by_product_code: usize,
    pub by_product_name: usize,
    pub manual: usize,
}

/// What the recommender has learned about one master.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterStat {
    pub master_name: String,
    pub product_count: usize,
    /// Mean confidence over the master's records.
    pub confidence: f64,
    pub products: Vec<String>,
}

pub struct Recommender {
    store: Arc<dyn KvStore>,
}

impl Recommender {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn assignments(&self) -> Vec<MasterAssignment> {
        self.store.load_master_assignments()
    }

    /// Records that `master_name` was chosen for a product key.
    ///
    /// An existing record for the key takes the new master and gains
    /// [`CONFIDENCE_STEP`] (capped at 1.0); otherwise a record is created at
    /// [`INITIAL_CONFIDENCE`]. Choosing nobody teaches nothing, and a blank
    /// code counts as no code.
    pub fn record_confirmation(
        &self,
        product_name: &str,
        master_name: &str,
        product_code: Option<&str>,
    ) -> Result<()> {
        if is_unassigned(master_name) {
            return Ok(());
        }
        let product_code = normalize_code(product_code);
        let mut assignments = self.assignments();
        let now = Timestamp::now();
        match assignments
            .iter_mut()
            .find(|a| a.matches_key(product_name, product_code))
        {
            Some(existing) => {
                existing.master_name = master_name.to_string();
                existing.confidence = (existing.confidence + CONFIDENCE_STEP).min(1.0);
                existing.last_assigned_time = Some(now);
            }
            None => assignments.push(MasterAssignment {
                product_name: product_name.to_string(),
                product_code: product_code.map(String::from),
                master_name: master_name.to_string(),
                confidence: INITIAL_CONFIDENCE,
                last_assigned_time: Some(now),
            }),
        }
        debug!(product_name, product_code, master_name, "assignment confirmed");
        self.store.save_master_assignments(&assignments)
    }

    /// The master for an exact product key, if the recommender is sure enough.
    pub fn recommend(&self, product_name: &str, product_code: Option<&str>) -> Option<String> {
        recommend_from(&self.assignments(), product_name, product_code).map(String::from)
    }

    /// Fills every unassigned task with its recommendation, or the
    /// unassigned sentinel when there is none. Tasks that already have a
    /// master are left alone.
    ///
    /// Returns how many tasks received a master.
    pub fn apply_to_import_batch(&self, tasks: &mut [Task]) -> usize {
        let assignments = self.assignments();
        let mut filled = 0;
        for task in tasks.iter_mut().filter(|t| t.is_unassigned()) {
            match recommend_from(&assignments, &task.product_name, task.product_code.as_deref()) {
                Some(master) => {
                    task.master_name = master.to_string();
                    filled += 1;
                }
                None => task.master_name = UNASSIGNED.to_string(),
            }
        }
        filled
    }

    /// Sorts tasks by how they came by their master: a master equal to the
    /// current recommendation counts as automatic, anything else as manual.
    pub fn compute_stats(&self, tasks: &[Task]) -> AssignmentStats {
        let assignments = self.assignments();
        let mut stats = AssignmentStats {
            total: tasks.len(),
            ..AssignmentStats::default()
        };
        for task in tasks {
            let code = normalize_code(task.product_code.as_deref());
            let recommended = recommend_from(&assignments, &task.product_name, code);
            if task.is_unassigned() || recommended != Some(task.master_name.as_str()) {
                stats.manual += 1;
                continue;
            }
            stats.auto_assigned += 1;
            if code.is_some() {
                stats.by_product_code += 1;
            } else {
                stats.by_product_name += 1;
            }
        }
        stats
    }

    /// Teaches the recommender from a task edit: a real master that differs
    /// from the previous one is a confirmation.
    pub fn learn_from_task_update(&self, task: &Task, previous_master: Option<&str>) -> Result<()> {
        if task.is_unassigned() || previous_master == Some(task.master_name.as_str()) {
            return Ok(());
        }
        self.record_confirmation(
            &task.product_name,
            &task.master_name,
            task.product_code.as_deref(),
        )
    }

    /// Per master: distinct product keys, mean confidence and product labels.
    pub fn master_stats(&self) -> Vec<MasterStat> {
        let mut by_master: BTreeMap<String, (BTreeSet<String>, f64, usize)> = BTreeMap::new();
        for a in self.assignments() {
            let entry = by_master.entry(a.master_name.clone()).or_default();
            entry.0.insert(a.product_label());
            entry.1 += a.confidence;
            entry.2 += 1;
        }
        by_master
            .into_iter()
            .map(|(master_name, (products, total, count))| MasterStat {
                master_name,
                product_count: products.len(),
                confidence: total / count as f64,
                products: products.into_iter().collect(),
            })
            .collect()
    }

    /// Drops records below `threshold`. Returns how many went.
    pub fn prune_below(&self, threshold: f64) -> Result<usize> {
        let mut assignments = self.assignments();
        let before = assignments.len();
        assignments.retain(|a| a.confidence >= threshold);
        let removed = before - assignments.len();
        if removed > 0 {
            self.store.save_master_assignments(&assignments)?;
        }
        Ok(removed)
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.assignments())?)
    }

    /// Replaces the learned list. A document that does not decode changes
    /// nothing.
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let assignments: Vec<MasterAssignment> = serde_json::from_str(json)?;
        self.store.save_master_assignments(&assignments)?;
        Ok(assignments.len())
    }
}

fn recommend_from<'a>(
    assignments: &'a [MasterAssignment],
    product_name: &str,
    product_code: Option<&str>,
) -> Option<&'a str> {
    let product_code = normalize_code(product_code);
    assignments
        .iter()
        .find(|a| a.matches_key(product_name, product_code))
        .filter(|a| product_code.is_some() || a.confidence > NAME_ONLY_THRESHOLD)
        .map(|a| a.master_name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::kv::MemoryStore;
    use crate::model::sample_task;

    fn test_recommender() -> Recommender {
        Recommender::new(Arc::new(MemoryStore::default()))
    }

    #[test]
    fn exact_key_match_only() {
        let rec = test_recommender();
        rec.record_confirmation("P", "Zhang", Some("C1")).unwrap();

        assert_eq!(rec.recommend("P", Some("C1")).as_deref(), Some("Zhang"));
        assert_eq!(rec.recommend("P", Some("C2")), None);
        assert_eq!(rec.recommend("P", None), None);
        assert_eq!(rec.recommend("Q", Some("C1")), None);
    }

    #[test]
    fn uncoded_record_needs_high_confidence() {
        let rec = test_recommender();
        for _ in 0..6 {
            rec.record_confirmation("P", "Zhang", None).unwrap();
        }
        // 0.3 + 5 × 0.1 = 0.8: not yet above the threshold.
        assert_eq!(rec.recommend("P", None), None);

        rec.record_confirmation("P", "Zhang", None).unwrap();
        assert_eq!(rec.recommend("P", None).as_deref(), Some("Zhang"));
        assert_eq!(rec.recommend("P", Some("C1")), None);
    }

    #[test]
    fn blank_code_shares_the_uncoded_record() {
        let rec = test_recommender();
        for _ in 0..6 {
            rec.record_confirmation("P", "Zhang", Some("")).unwrap();
        }
        rec.record_confirmation("P", "Zhang", None).unwrap();

        let assignments = rec.assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].product_code, None);
        assert_eq!(rec.recommend("P", None).as_deref(), Some("Zhang"));
        assert_eq!(rec.recommend("P", Some(" ")).as_deref(), Some("Zhang"));
    }

    #[test]
    fn confidence_never_decreases_and_saturates() {
        let rec = test_recommender();
        let mut last = 0.0;
        for _ in 0..15 {
            rec.record_confirmation("P", "Zhang", Some("C1")).unwrap();
            let c = rec.assignments()[0].confidence;
            assert!(c >= last);
            last = c;
        }
        assert!((last - 1.0).abs() < 1e-9);
        assert_eq!(rec.assignments().len(), 1);
    }

    #[test]
    fn confirming_another_master_takes_over_the_key() {
        let rec = test_recommender();
        rec.record_confirmation("P", "Zhang", Some("C1")).unwrap();
        rec.record_confirmation("P", "Li", Some("C1")).unwrap();

        let all = rec.assignments();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].master_name, "Li");
        assert!((all[0].confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn unassigned_confirmation_is_ignored() {
        let rec = test_recommender();
        rec.record_confirmation("P", UNASSIGNED, Some("C1")).unwrap();
        rec.record_confirmation("P", "待分配", Some("C1")).unwrap();

        assert!(rec.assignments().is_empty());
    }

    #[test]
    fn import_batch_scenario() {
        let rec = test_recommender();
        rec.record_confirmation("Valve-Body", "Li", Some("V1")).unwrap();

        let mut uncoded = sample_task("t3");
        uncoded.product_code = None;
        let mut tasks = vec![sample_task("t1"), sample_task("t2"), uncoded];

        let filled = rec.apply_to_import_batch(&mut tasks);

        assert_eq!(filled, 2);
        assert_eq!(tasks[0].master_name, "Li");
        assert_eq!(tasks[1].master_name, "Li");
        assert_eq!(tasks[2].master_name, UNASSIGNED);

        let stats = rec.compute_stats(&tasks);
        assert_eq!(
            stats,
            AssignmentStats {
                total: 3,
                auto_assigned: 2,
                by_product_code: 2,
                by_product_name: 0,
                manual: 1,
            }
        );
    }

    #[test]
    fn import_batch_keeps_explicit_choices_and_normalizes_legacy_sentinel() {
        let rec = test_recommender();
        rec.record_confirmation("Valve-Body", "Li", Some("V1")).unwrap();

        let mut chosen = sample_task("t1");
        chosen.master_name = "Zhou".into();
        let mut legacy = sample_task("t2");
        legacy.product_code = Some("V9".into());
        legacy.master_name = "待分配".into();
        let mut tasks = vec![chosen, legacy];

        rec.apply_to_import_batch(&mut tasks);

        assert_eq!(tasks[0].master_name, "Zhou");
        assert_eq!(tasks[1].master_name, UNASSIGNED);
        let stats = rec.compute_stats(&tasks);
        assert_eq!(stats.manual, 2);
        assert_eq!(stats.auto_assigned + stats.manual, stats.total);
    }

    #[test]
    fn learns_only_from_changed_real_masters() {
        let rec = test_recommender();
        let mut task = sample_task("t1");
        rec.learn_from_task_update(&task, None).unwrap();
        assert!(rec.assignments().is_empty());

        task.master_name = "Li".into();
        rec.learn_from_task_update(&task, Some(UNASSIGNED)).unwrap();
        rec.learn_from_task_update(&task, Some("Li")).unwrap();

        let all = rec.assignments();
        assert_eq!(all.len(), 1);
        assert!((all[0].confidence - INITIAL_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn master_stats_group_by_master() {
        let rec = test_recommender();
        rec.record_confirmation("P", "Li", Some("C1")).unwrap();
        rec.record_confirmation("P", "Li", Some("C1")).unwrap();
        rec.record_confirmation("Q", "Li", None).unwrap();
        rec.record_confirmation("R", "Zhou", None).unwrap();

        let stats = rec.master_stats();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].master_name, "Li");
        assert_eq!(stats[0].product_count, 2);
        assert_eq!(stats[0].products, vec!["P(C1)".to_string(), "Q".to_string()]);
        assert!((stats[0].confidence - 0.35).abs() < 1e-9);
    }

    #[test]
    fn prune_removes_only_weak_records() {
        let rec = test_recommender();
        rec.record_confirmation("P", "Li", Some("C1")).unwrap();
        rec.record_confirmation("P", "Li", Some("C1")).unwrap();
        rec.record_confirmation("Q", "Li", None).unwrap();

        assert_eq!(rec.prune_below(0.35).unwrap(), 1);
        assert_eq!(rec.assignments().len(), 1);
        assert_eq!(rec.prune_below(DEFAULT_PRUNE_THRESHOLD).unwrap(), 0);
    }

    #[test]
    fn export_import_round_trip_and_bad_json() {
        let rec = test_recommender();
        rec.record_confirmation("P", "Li", Some("C1")).unwrap();
        let json = rec.export_json().unwrap();

        let other = test_recommender();
        assert_eq!(other.import_json(&json).unwrap(), 1);
        assert_eq!(other.assignments(), rec.assignments());

        assert!(other.import_json("not json").is_err());
        assert_eq!(other.assignments().len(), 1);
    }
}
