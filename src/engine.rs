//! Relational engine adapter: an embedded `SQLite` database over a fixed
//! schema, persisted as a framed blob inside the key-value store.
//!
//! The database lives in memory. Every mutating operation ends by writing
//! the whole image back to [`keys::ENGINE_BLOB`]; that write is always the
//! last step of a successful operation.
//!
//! ```text
//! Engine
//!   conn: Connection (in-memory)
//!   store ── sqlite_db_data      base64(frame(zstd(image)))
//!         ── sqlite_last_save    RFC 3339 timestamp
//! ```

mod assignments;
mod blob;
mod export;
mod logs;
mod masters;
mod schema;
mod settings;
mod stats;
mod tasks;

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use jiff::Timestamp;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::kv::{KvError, KvStore, keys};
use crate::model::RosterEntry;

pub use assignments::{Alternative, Recommendation};
pub use logs::LogEntry;
pub use schema::{DB_NAME, SCHEMA_VERSION};
pub use stats::{DailyProgress, MasterProductivity, Statistics};
pub use tasks::{BatchOutcome, DateRange, HistoryEntry, Page, TaskFilter};

/// Errors that can occur in the relational engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine initialization failed: {0}")]
    Init(String),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("blob schema version {found}, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("corrupt engine blob: {0}")]
    Corrupt(String),

    #[error("failed to persist engine state: {0}")]
    Persist(#[from] KvError),

    #[error("invalid task {id}: {reason}")]
    InvalidTask { id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("import rejected: {0}")]
    ImportFormat(String),
}

pub type Result<T> = core::result::Result<T, EngineError>;

/// A single task that could not be written as part of a batch.
///
/// Row errors are data, not failures: the batch carries on without the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowWriteError {
    pub task_id: String,
    pub reason: String,
}

/// How [`Engine::load_persisted`] ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The persisted image was restored.
    Restored,
    /// Nothing was persisted; a fresh engine was created.
    Fresh,
    /// The persisted blob was unusable; a fresh engine replaced it.
    Replaced { reason: String },
}

/// Snapshot of the engine's condition, for status displays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub initialized: bool,
    pub image_bytes: usize,
    pub table_count: usize,
    pub last_save: Option<Timestamp>,
    pub version: u32,
}

/// The relational engine and its persistence handle.
pub struct Engine {
    conn: Connection,
    store: Option<Arc<dyn KvStore>>,
    roster: Vec<RosterEntry>,
    initialized: bool,
    last_save: Cell<Option<Timestamp>>,
}

impl Engine {
    /// Allocates an empty in-memory engine.
    ///
    /// With no `store`, state is never persisted (useful for tests and
    /// throwaway sessions).
    pub fn open(store: Option<Arc<dyn KvStore>>, roster: Vec<RosterEntry>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| EngineError::Init(e.to_string()))?;
        Ok(Self {
            conn,
            store,
            roster,
            initialized: false,
            last_save: Cell::new(None),
        })
    }

    /// Creates the schema if absent. Idempotent.
    ///
    /// A first run also seeds the roster and default settings.
    pub fn initialize(&mut self) -> Result<()> {
        let first_run = schema::create(&self.conn, &self.roster)
            .map_err(|e| EngineError::Init(e.to_string()))?;
        self.initialized = true;
        if first_run {
            info!(masters = self.roster.len(), "engine schema created");
            self.log_event("info", "database initialized", None);
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Replaces engine state with a previously exported blob.
    ///
    /// A blob that cannot be decoded is not fatal: the engine starts fresh
    /// instead. A blob from another schema version is first copied to
    /// [`keys::ENGINE_BLOB_BACKUP`]. Only a failure to create the fresh
    /// engine is an error.
    pub fn load_persisted(&mut self, blob: &[u8]) -> Result<LoadOutcome> {
        match self.restore_blob(blob) {
            Ok(()) => {
                debug!(bytes = blob.len(), "engine restored from blob");
                Ok(LoadOutcome::Restored)
            }
            Err(e) => {
                warn!(error = %e, "persisted engine unusable, starting fresh");
                if matches!(e, EngineError::SchemaMismatch { .. }) {
                    self.backup_stale_blob(blob);
                }
                self.reset()?;
                self.log_event(
                    "warn",
                    "persisted database replaced",
                    Some(serde_json::json!({ "reason": e.to_string() })),
                );
                Ok(LoadOutcome::Replaced {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Loads whatever the store holds under [`keys::ENGINE_BLOB`], or starts
    /// fresh when there is nothing.
    pub fn load_from_store(&mut self) -> Result<LoadOutcome> {
        let encoded = match &self.store {
            Some(store) => match store.get(keys::ENGINE_BLOB) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "could not read persisted engine");
                    None
                }
            },
            None => None,
        };

        let Some(encoded) = encoded else {
            self.initialize()?;
            return Ok(LoadOutcome::Fresh);
        };

        match BASE64.decode(encoded.trim()) {
            Ok(blob) => self.load_persisted(&blob),
            Err(e) => {
                warn!(error = %e, "persisted engine is not base64, starting fresh");
                self.reset()?;
                Ok(LoadOutcome::Replaced {
                    reason: format!("invalid base64: {e}"),
                })
            }
        }
    }

    /// The full engine state as a framed blob.
    pub fn export_blob(&self) -> Result<Vec<u8>> {
        let image = blob::capture_image(&self.conn)?;
        blob::encode(&image, SCHEMA_VERSION)
    }

    /// The raw `SQLite` database file.
    pub fn export_image(&self) -> Result<Vec<u8>> {
        blob::capture_image(&self.conn)
    }

    /// Replaces engine state with a raw `SQLite` image and persists it.
    ///
    /// The image is restored and brought up to the current schema on a
    /// separate connection; one that fails either step leaves the current
    /// state untouched.
    pub fn import_image(&mut self, image: &[u8]) -> Result<()> {
        let mut conn = Connection::open_in_memory().map_err(|e| EngineError::Init(e.to_string()))?;
        blob::restore_image(&mut conn, image)?;
        schema::create(&conn, &self.roster)?;
        self.conn = conn;
        self.initialized = true;
        self.persist()
    }

    /// Writes the current state to the store. A no-op without a store.
    pub fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let encoded = BASE64.encode(self.export_blob()?);
        let now = Timestamp::now();
        store.set(keys::ENGINE_BLOB, &encoded)?;
        store.set(keys::ENGINE_LAST_SAVE, &now.to_string())?;
        self.last_save.set(Some(now));
        debug!(bytes = encoded.len(), "engine persisted");
        Ok(())
    }

    pub fn health(&self) -> Health {
        Health {
            initialized: self.initialized,
            image_bytes: self.export_image().map_or(0, |image| image.len()),
            table_count: self.table_names().map_or(0, |t| t.len()),
            last_save: self.last_save.get(),
            version: SCHEMA_VERSION,
        }
    }

    /// User tables, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Row count per user table.
    pub fn record_counts(&self) -> Result<BTreeMap<String, i64>> {
        let mut counts = BTreeMap::new();
        for table in self.table_names()? {
            // Table names come from sqlite_master, not from input.
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{table}\""),
                [],
                |row| row.get(0),
            )?;
            counts.insert(table, count);
        }
        Ok(counts)
    }

    pub(crate) fn store(&self) -> Option<&Arc<dyn KvStore>> {
        self.store.as_ref()
    }

    /// Runs `f` inside a transaction, committing only if it succeeds.
    fn in_transaction<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| EngineError::Transaction(e.to_string()))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| EngineError::Transaction(e.to_string()))?;
        Ok(value)
    }

    /// Passes `result` through, recording a failure in the system log.
    ///
    /// The error row is persisted on a best-effort basis so it survives a
    /// reload even though the failed operation never reaches its own persist.
    fn logged<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(operation, error = %e, "engine operation failed");
            self.log_error(operation, &e.to_string(), None);
            if let Err(persist_err) = self.persist() {
                warn!(operation, error = %persist_err, "could not persist failure log");
            }
        }
        result
    }

    fn restore_blob(&mut self, blob: &[u8]) -> Result<()> {
        let image = blob::decode(blob, SCHEMA_VERSION)?;
        blob::restore_image(&mut self.conn, &image)?;
        schema::create(&self.conn, &self.roster)?;
        self.initialized = true;
        Ok(())
    }

    /// Drops all state and creates a fresh schema.
    fn reset(&mut self) -> Result<()> {
        self.conn = Connection::open_in_memory().map_err(|e| EngineError::Init(e.to_string()))?;
        self.initialized = false;
        self.initialize()
    }

    fn backup_stale_blob(&self, blob: &[u8]) {
        let Some(store) = &self.store else {
            return;
        };
        let saved = store
            .set(keys::ENGINE_BLOB_BACKUP, &BASE64.encode(blob))
            .and_then(|()| store.set(keys::BACKUP_TIME, &Timestamp::now().to_string()));
        if let Err(e) = saved {
            warn!(error = %e, "could not back up stale engine blob");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::kv::MemoryStore;
    use crate::model::{default_roster, sample_task};

    /// An initialized engine persisting into a fresh in-memory store.
    pub(crate) fn test_engine() -> (Arc<dyn KvStore>, Engine) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::with_quota(16 * 1024 * 1024));
        let mut engine = Engine::open(Some(store.clone()), default_roster()).unwrap();
        engine.initialize().unwrap();
        (store, engine)
    }

    #[test]
    fn initialize_is_idempotent_and_seeds_once() {
        let (_store, mut engine) = test_engine();
        engine.initialize().unwrap();

        assert_eq!(engine.masters().unwrap().len(), default_roster().len());
        let counts = engine.record_counts().unwrap();
        assert_eq!(counts["settings"], 6);
    }

    #[test]
    fn schema_has_the_expected_tables() {
        let (_store, engine) = test_engine();
        let tables = engine.table_names().unwrap();
        for table in [
            "import_settings",
            "master_assignments",
            "masters",
            "settings",
            "system_logs",
            "task_history",
            "tasks",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }

    #[test]
    fn blob_round_trip_reproduces_tasks() {
        let (_store, mut engine) = test_engine();
        let mut task = sample_task("t1");
        task.coefficient = Some(1.5);
        task.quantity = Some(3);
        task.delivery_time = Some("2025-02-01".into());
        engine.upsert_task(&task).unwrap();
        engine.upsert_task(&sample_task("t2")).unwrap();
        let blob = engine.export_blob().unwrap();

        let mut restored = Engine::open(None, default_roster()).unwrap();
        let outcome = restored.load_persisted(&blob).unwrap();

        assert_eq!(outcome, LoadOutcome::Restored);
        assert_eq!(restored.get_task("t1").unwrap(), Some(task));
        assert_eq!(restored.all_tasks().unwrap(), engine.all_tasks().unwrap());
    }

    #[test]
    fn undecodable_blob_falls_back_to_fresh_engine() {
        let mut engine = Engine::open(None, default_roster()).unwrap();

        let outcome = engine.load_persisted(b"definitely not a blob").unwrap();

        assert!(matches!(outcome, LoadOutcome::Replaced { .. }));
        assert!(engine.is_initialized());
        assert_eq!(engine.count_tasks().unwrap(), 0);
    }

    #[test]
    fn schema_mismatch_backs_up_stale_blob() {
        let (store, engine) = test_engine();
        let image = engine.export_image().unwrap();
        let stale = blob::encode(&image, SCHEMA_VERSION + 1).unwrap();

        let mut reloaded = Engine::open(Some(store.clone()), default_roster()).unwrap();
        let outcome = reloaded.load_persisted(&stale).unwrap();

        assert!(matches!(outcome, LoadOutcome::Replaced { .. }));
        let saved = store.get(keys::ENGINE_BLOB_BACKUP).unwrap().unwrap();
        assert_eq!(BASE64.decode(saved).unwrap(), stale);
        assert!(store.get(keys::BACKUP_TIME).unwrap().is_some());
    }

    #[test]
    fn load_from_store_restores_persisted_state() {
        let (store, mut engine) = test_engine();
        engine.upsert_task(&sample_task("t1")).unwrap();
        assert!(store.get(keys::ENGINE_BLOB).unwrap().is_some());
        assert!(store.get(keys::ENGINE_LAST_SAVE).unwrap().is_some());

        let mut reloaded = Engine::open(Some(store), default_roster()).unwrap();
        let outcome = reloaded.load_from_store().unwrap();

        assert_eq!(outcome, LoadOutcome::Restored);
        assert_eq!(reloaded.count_tasks().unwrap(), 1);
    }

    #[test]
    fn load_from_empty_store_is_fresh() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let mut engine = Engine::open(Some(store), default_roster()).unwrap();

        assert_eq!(engine.load_from_store().unwrap(), LoadOutcome::Fresh);
        assert!(engine.is_initialized());
    }

    #[test]
    fn load_from_store_with_bad_base64_starts_fresh() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        store.set(keys::ENGINE_BLOB, "%%% not base64 %%%").unwrap();
        let mut engine = Engine::open(Some(store), default_roster()).unwrap();

        assert!(matches!(
            engine.load_from_store().unwrap(),
            LoadOutcome::Replaced { .. }
        ));
    }

    #[test]
    fn persist_failure_surfaces_quota_error() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::with_quota(64));
        let mut engine = Engine::open(Some(store), default_roster()).unwrap();
        engine.initialize().unwrap();

        let err = engine.persist().unwrap_err();

        assert!(matches!(err, EngineError::Persist(KvError::Quota { .. })));
    }

    #[test]
    fn health_reports_tables_and_version() {
        let (_store, mut engine) = test_engine();
        engine.persist().unwrap();

        let health = engine.health();

        assert!(health.initialized);
        assert!(health.image_bytes > 0);
        assert_eq!(health.table_count, 7);
        assert_eq!(health.version, SCHEMA_VERSION);
        assert!(health.last_save.is_some());
    }
}
