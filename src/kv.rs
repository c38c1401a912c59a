//! Key-value storage: durable text values addressed by string keys.
//!
//! This is the board's lowest storage tier. It holds the encoded engine
//! blob, user settings, learned assignments and, when the engine is not
//! available, the task list itself.
//!
//! Values are text. Structured values are stored as JSON; loading a missing
//! or unreadable structured value returns a documented default instead of
//! failing, so a damaged key never blocks startup.

mod dir;
pub mod keys;
mod memory;

use std::io;

use jiff::Timestamp;
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::model::{ImportSettings, MasterAssignment, Task, UserSettings};

pub use dir::DirStore;
pub use memory::MemoryStore;

/// Errors that can occur during key-value operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage quota exceeded writing {key}: need {needed} bytes, {available} available")]
    Quota {
        key: String,
        needed: u64,
        available: u64,
    },

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, KvError>;

/// A durable string-keyed store with a byte quota.
///
/// Usage is measured as `key.len() + value.len()` summed over all entries.
/// A `set` that would push usage past the quota fails with
/// [`KvError::Quota`] and leaves the previous value in place.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>>;

    fn quota_bytes(&self) -> u64;

    fn used_bytes(&self) -> Result<u64>;
}

/// Upper bound on the size of a single capacity probe.
const MAX_PROBE_BYTES: u64 = 64 * 1024 * 1024;

/// Number of probe writes before the estimate gives up refining.
const MAX_PROBES: u32 = 12;

impl dyn KvStore + '_ {
    /// Stores `value` as JSON.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.set(key, &json)
    }

    /// Loads a JSON value, falling back to `default` when the key is missing
    /// or does not decode.
    pub fn load_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key, error = %e, "unreadable value, using default");
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                warn!(key, error = %e, "failed to read value, using default");
                default
            }
        }
    }

    /// Task list snapshot. Default: empty.
    pub fn load_tasks(&self) -> Vec<Task> {
        self.load_or(keys::TASKS, Vec::new())
    }

    pub fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        self.save(keys::TASKS, tasks)
    }

    /// User settings. Default: `{coefficient: 1.2}`.
    pub fn load_user_settings(&self) -> UserSettings {
        self.load_or(keys::SETTINGS, UserSettings::default())
    }

    pub fn save_user_settings(&self, settings: &UserSettings) -> Result<()> {
        self.save(keys::SETTINGS, settings)
    }

    /// Learned assignments. Default: empty.
    pub fn load_master_assignments(&self) -> Vec<MasterAssignment> {
        self.load_or(keys::MASTER_ASSIGNMENTS, Vec::new())
    }

    pub fn save_master_assignments(&self, assignments: &[MasterAssignment]) -> Result<()> {
        self.save(keys::MASTER_ASSIGNMENTS, assignments)
    }

    /// Last import mapping. Default: none.
    pub fn load_import_settings(&self) -> Option<ImportSettings> {
        self.load_or(keys::IMPORT_SETTINGS, None)
    }

    pub fn save_import_settings(&self, settings: &ImportSettings) -> Result<()> {
        self.save(keys::IMPORT_SETTINGS, settings)
    }

    /// Bytes still writable before the quota is hit.
    ///
    /// Starts from the store's own accounting and confirms it with at most
    /// [`MAX_PROBES`] probe writes, halving the probe on each refusal. The
    /// probe key is removed before returning.
    pub fn estimate_available_bytes(&self) -> Result<u64> {
        let remaining = self.quota_bytes().saturating_sub(self.used_bytes()?);
        let overhead = keys::PROBE.len() as u64;
        let mut candidate = remaining.saturating_sub(overhead).min(MAX_PROBE_BYTES);
        let mut confirmed = 0;

        for _ in 0..MAX_PROBES {
            if candidate == 0 {
                break;
            }
            let probe = "x".repeat(usize::try_from(candidate).unwrap_or(usize::MAX));
            match self.set(keys::PROBE, &probe) {
                Ok(()) => {
                    confirmed = candidate;
                    break;
                }
                Err(KvError::Quota { .. }) => candidate /= 2,
                Err(e) => {
                    if let Err(cleanup) = self.remove(keys::PROBE) {
                        warn!(error = %cleanup, "could not remove capacity probe");
                    }
                    return Err(e);
                }
            }
        }

        self.remove(keys::PROBE)?;
        Ok(confirmed)
    }

    /// Removes exactly the listed keys.
    pub fn clear(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// Keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// Snapshot keys under `prefix`: the prefix followed only by digits,
    /// oldest first.
    pub fn snapshot_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .keys_with_prefix(prefix)?
            .into_iter()
            .filter(|k| {
                let rest = &k[prefix.len()..];
                !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
            })
            .collect();
        keys.sort_by_key(|k| (k.len(), k.clone()));
        Ok(keys)
    }

    /// Deletes all but the newest `keep` snapshot keys under `prefix`.
    ///
    /// Other keys sharing the prefix (`sqlite_backup_time`, say) are left alone.
    pub fn prune_prefix(&self, prefix: &str, keep: usize) -> Result<usize> {
        let keys = self.snapshot_keys(prefix)?;
        let excess = keys.len().saturating_sub(keep);
        for key in &keys[..excess] {
            self.remove(key)?;
        }
        Ok(excess)
    }

    /// Serializes the four `kanban_*` entities plus an export time.
    pub fn export_all(&self) -> Result<String> {
        let export = serde_json::json!({
            "tasks": self.load_tasks(),
            "settings": self.load_user_settings(),
            "importSettings": self.load_import_settings(),
            "masterAssignments": self.load_master_assignments(),
            "exportTime": Timestamp::now(),
        });
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Restores whichever `kanban_*` entities are present in `json`.
    ///
    /// The whole document is decoded before anything is written.
    pub fn import_all(&self, json: &str) -> Result<()> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Export {
            tasks: Option<Vec<Task>>,
            settings: Option<UserSettings>,
            import_settings: Option<ImportSettings>,
            master_assignments: Option<Vec<MasterAssignment>>,
        }

        let export: Export = serde_json::from_str(json)?;
        if let Some(tasks) = export.tasks {
            self.save_tasks(&tasks)?;
        }
        if let Some(settings) = export.settings {
            self.save_user_settings(&settings)?;
        }
        if let Some(settings) = export.import_settings {
            self.save_import_settings(&settings)?;
        }
        if let Some(assignments) = export.master_assignments {
            self.save_master_assignments(&assignments)?;
        }
        Ok(())
    }
}

/// Quota check shared by the store implementations.
///
/// `current` is the usage before the write, `old_len` the size of the entry
/// being replaced (zero if new).
fn check_quota(key: &str, value: &str, current: u64, old_len: u64, quota: u64) -> Result<()> {
    let needed = (key.len() + value.len()) as u64;
    let available = quota.saturating_sub(current.saturating_sub(old_len));
    if needed > available {
        return Err(KvError::Quota {
            key: key.to_string(),
            needed,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::sample_task;

    fn store(quota: u64) -> MemoryStore {
        MemoryStore::with_quota(quota)
    }

    /// Refuses every write and every removal.
    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(io::Error::other("disk gone").into())
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Err(io::Error::other("still gone").into())
        }

        fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn quota_bytes(&self) -> u64 {
            1024
        }

        fn used_bytes(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn missing_keys_load_documented_defaults() {
        let s = store(1024);
        let kv: &dyn KvStore = &s;

        assert!(kv.load_tasks().is_empty());
        assert!(kv.load_master_assignments().is_empty());
        assert!(kv.load_import_settings().is_none());
        assert!((kv.load_user_settings().coefficient - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn corrupt_value_loads_default() {
        let s = store(1024);
        let kv: &dyn KvStore = &s;
        kv.set(keys::TASKS, "{not json").unwrap();
        kv.set(keys::SETTINGS, "[1, 2]").unwrap();

        assert!(kv.load_tasks().is_empty());
        assert!((kv.load_user_settings().coefficient - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_load_tasks() {
        let s = store(64 * 1024);
        let kv: &dyn KvStore = &s;
        let tasks = vec![sample_task("a"), sample_task("b")];

        kv.save_tasks(&tasks).unwrap();

        assert_eq!(kv.load_tasks(), tasks);
    }

    #[test]
    fn write_over_quota_is_refused_and_keeps_old_value() {
        let s = store(32);
        let kv: &dyn KvStore = &s;
        kv.set("k", "small").unwrap();

        let err = kv.set("k", &"x".repeat(64)).unwrap_err();

        assert!(matches!(err, KvError::Quota { .. }));
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("small"));
    }

    #[test]
    fn replacing_a_value_frees_its_old_size() {
        let s = store(20);
        let kv: &dyn KvStore = &s;
        kv.set("k", &"x".repeat(18)).unwrap();

        // Still fits: the old 18 bytes are released by the replacement.
        kv.set("k", &"y".repeat(19)).unwrap();
    }

    #[test]
    fn available_estimate_is_bounded_and_cleans_up() {
        let s = store(10_000);
        let kv: &dyn KvStore = &s;
        kv.set("data", &"x".repeat(1_000)).unwrap();

        let available = kv.estimate_available_bytes().unwrap();

        let expected = 10_000 - 1_004 - keys::PROBE.len() as u64;
        assert_eq!(available, expected);
        assert!(kv.get(keys::PROBE).unwrap().is_none());
    }

    #[test]
    fn available_estimate_is_zero_when_full() {
        let s = store(10);
        let kv: &dyn KvStore = &s;
        kv.set("k", "12345678").unwrap();

        assert_eq!(kv.estimate_available_bytes().unwrap(), 0);
    }

    #[test]
    fn clear_removes_only_listed_keys() {
        let s = store(1024);
        let kv: &dyn KvStore = &s;
        kv.set("a", "1").unwrap();
        kv.set("b", "2").unwrap();
        kv.set("c", "3").unwrap();

        kv.clear(&["a", "c", "missing"]).unwrap();

        assert_eq!(kv.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn prune_prefix_keeps_newest() {
        let s = store(1024);
        let kv: &dyn KvStore = &s;
        for millis in [1_000, 2_000, 3_000] {
            kv.set(&keys::timestamped("snap_", millis), "x").unwrap();
        }
        kv.set("other", "y").unwrap();
        kv.set("snap_time", "z").unwrap();

        let removed = kv.prune_prefix("snap_", 2).unwrap();

        assert_eq!(removed, 1);
        assert_eq!(
            kv.snapshot_keys("snap_").unwrap(),
            vec!["snap_2000".to_string(), "snap_3000".to_string()]
        );
        assert!(kv.get("other").unwrap().is_some());
        assert!(kv.get("snap_time").unwrap().is_some());
    }

    #[test]
    fn export_all_then_import_all_restores_entities() {
        let source = store(64 * 1024);
        let kv: &dyn KvStore = &source;
        kv.save_tasks(&[sample_task("a")]).unwrap();
        kv.save_user_settings(&UserSettings { coefficient: 1.5 })
            .unwrap();
        let json = kv.export_all().unwrap();

        let target = store(64 * 1024);
        let kv2: &dyn KvStore = &target;
        kv2.import_all(&json).unwrap();

        assert_eq!(kv2.load_tasks().len(), 1);
        assert!((kv2.load_user_settings().coefficient - 1.5).abs() < f64::EPSILON);
        assert!(kv2.load_import_settings().is_none());
    }

    #[test]
    fn import_all_rejects_malformed_document_without_writing() {
        let s = store(1024);
        let kv: &dyn KvStore = &s;

        assert!(kv.import_all("{\"tasks\": 5}").is_err());
        assert!(kv.keys().unwrap().is_empty());
    }

    #[test]
    fn failed_capacity_estimate_reports_the_write_error() {
        let kv: &dyn KvStore = &BrokenStore;

        let err = kv.estimate_available_bytes().unwrap_err();

        assert!(err.to_string().contains("disk gone"));
    }
}
