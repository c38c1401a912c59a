//! Reserved key names.
//!
//! Every key the board writes is listed here; nothing else in the store is
//! ever touched by a cleanup.

/// Task list snapshot, used only when the engine is unavailable.
pub const TASKS: &str = "kanban_tasks";
pub const SETTINGS: &str = "kanban_settings";
pub const IMPORT_SETTINGS: &str = "kanban_import_settings";
pub const MASTER_ASSIGNMENTS: &str = "kanban_master_assignments";

/// The encoded engine blob. The primary data key: never removed by cleanup.
pub const ENGINE_BLOB: &str = "sqlite_db_data";
pub const ENGINE_LAST_SAVE: &str = "sqlite_last_save";
pub const ENGINE_BLOB_BACKUP: &str = "sqlite_db_data_backup";
pub const BACKUP_TIME: &str = "sqlite_backup_time";
pub const LAST_IMPORT: &str = "sqlite_last_import";
pub const LAST_BACKUP: &str = "sqlite_last_backup";

/// A portable package left for the next startup to pick up.
pub const PORTABLE_PACKAGE: &str = "portable_package_data";

/// Prefix of database-export snapshots taken before an import.
pub const ENGINE_BACKUP_PREFIX: &str = "sqlite_backup_";

/// Prefix of pre-migration snapshots of the `kanban_*` keys.
pub const KV_BACKUP_PREFIX: &str = "kanban_backup_";

/// Scratch key used by capacity probing.
pub const PROBE: &str = "storage_test";

/// Marker keys the storage policy may remove.
pub const MARKER_KEYS: [&str; 4] = [ENGINE_BLOB_BACKUP, BACKUP_TIME, LAST_IMPORT, LAST_BACKUP];

/// Key for a timestamped snapshot.
pub fn timestamped(prefix: &str, millis: i64) -> String {
    format!("{prefix}{millis}")
}
