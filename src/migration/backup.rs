//! Safety snapshots taken around migrations and imports.
//!
//! ```text
//! kanban_backup_<millis>   the kanban_* entities, as exported by the store
//! sqlite_backup_<millis>   a database export document
//! ```
//!
//! Only the newest snapshots of each kind are kept.

use jiff::Timestamp;
use tracing::debug;

use crate::engine::Engine;
use crate::kv::{KvError, KvStore, keys};

use super::Result;

/// Snapshots the key-value entities. Returns the key written.
pub(super) fn snapshot_store(
    store: &dyn KvStore,
    keep: usize,
    now: Timestamp,
) -> core::result::Result<String, KvError> {
    let key = keys::timestamped(keys::KV_BACKUP_PREFIX, now.as_millisecond());
    store.set(&key, &store.export_all()?)?;
    let pruned = store.prune_prefix(keys::KV_BACKUP_PREFIX, keep)?;
    debug!(key, pruned, "key-value snapshot written");
    Ok(key)
}

/// Snapshots the whole engine as an export document. Returns the key
/// written.
pub(super) fn snapshot_engine(
    engine: &Engine,
    store: &dyn KvStore,
    keep: usize,
    now: Timestamp,
) -> Result<String> {
    let key = keys::timestamped(keys::ENGINE_BACKUP_PREFIX, now.as_millisecond());
    store.set(&key, &engine.export_database()?)?;
    let pruned = store.prune_prefix(keys::ENGINE_BACKUP_PREFIX, keep)?;
    debug!(key, pruned, "engine snapshot written");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::tests::test_engine;
    use crate::kv::MemoryStore;
    use crate::model::sample_task;

    #[test]
    fn store_snapshots_are_pruned_to_the_newest() {
        let backing = MemoryStore::with_quota(1024 * 1024);
        let store: &dyn KvStore = &backing;
        store.save_tasks(&[sample_task("t1")]).unwrap();

        for millis in [1_000, 2_000, 3_000] {
            let now = Timestamp::from_millisecond(millis).unwrap();
            snapshot_store(store, 2, now).unwrap();
        }

        assert_eq!(
            store.snapshot_keys(keys::KV_BACKUP_PREFIX).unwrap(),
            ["kanban_backup_2000", "kanban_backup_3000"]
        );
        let snapshot = store.get("kanban_backup_3000").unwrap().unwrap();
        assert!(snapshot.contains("t1"));
    }

    #[test]
    fn engine_snapshot_is_an_export_document() {
        let (store, mut engine) = test_engine();
        engine.upsert_task(&sample_task("t1")).unwrap();

        let key = snapshot_engine(&engine, &*store, 5, Timestamp::now()).unwrap();

        let json = store.get(&key).unwrap().unwrap();
        let (_other_store, mut restored) = test_engine();
        restored.import_database(&json, 5).unwrap();
        assert!(restored.get_task("t1").unwrap().is_some());
        // The snapshot key itself is not mistaken for a marker.
        assert!(store.get(keys::BACKUP_TIME).unwrap().is_none());
    }
}
