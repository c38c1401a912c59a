//! Storage-mode policy: where the board's data should live as it grows,
//! and when it gets copied somewhere safer.
//!
//! The key-value store has a hard ceiling. While the engine blob stays
//! well under it the store alone is enough; close to the ceiling the board
//! should also keep database files on disk; past it, files are the only
//! dependable home.
//!
//! ```text
//! size < 80% ceiling    local store
//! size <= ceiling       hybrid
//! size >  ceiling       file
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jiff::Timestamp;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::engine::{Engine, EngineError};
use crate::kv::{KvError, KvStore, keys};

/// Share of the ceiling above which the store is considered crowded.
const HYBRID_THRESHOLD: f64 = 0.8;

const FILE_PREFIX: &str = "production-kanban-";
pub const FILE_EXTENSION: &str = "db";

/// Errors that can occur applying the storage policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

pub type Result<T> = core::result::Result<T, PolicyError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PolicyError + '_ {
    move |source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageMode {
    LocalStore,
    Hybrid,
    File,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalStore => "local store",
            Self::Hybrid => "hybrid",
            Self::File => "file",
        })
    }
}

/// Picks the mode for a blob of `size_mb` against a `ceiling_mb` store.
pub fn mode_for(size_mb: f64, ceiling_mb: f64) -> StorageMode {
    if size_mb < ceiling_mb * HYBRID_THRESHOLD {
        StorageMode::LocalStore
    } else if size_mb <= ceiling_mb {
        StorageMode::Hybrid
    } else {
        StorageMode::File
    }
}

/// Where storage stands right now. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub mode: StorageMode,
    /// Size of the stored engine blob in megabytes.
    pub size_mb: f64,
    pub last_backup: Option<String>,
    pub last_import: Option<String>,
    pub has_backup: bool,
}

/// File name for a database file written on `now`'s date.
pub fn dated_file_name(now: Timestamp) -> String {
    format!("{FILE_PREFIX}{}.{FILE_EXTENSION}", now.strftime("%Y-%m-%d"))
}

pub struct StoragePolicy {
    store: Arc<dyn KvStore>,
    ceiling_mb: f64,
    interval_minutes: u64,
    auto_backup: bool,
    max_backups: usize,
    backup_dir: PathBuf,
}

impl StoragePolicy {
    pub fn new(config: &Config, home: &Path, store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            ceiling_mb: config.quota_mb,
            interval_minutes: config.backup_interval_minutes,
            auto_backup: config.auto_backup,
            max_backups: config.max_backups,
            backup_dir: config::backup_dir(home),
        }
    }

    /// Size of the stored engine blob in megabytes, zero when there is none.
    pub fn blob_size_mb(&self) -> Result<f64> {
        let bytes = self.store.get(keys::ENGINE_BLOB)?.map_or(0, |v| v.len());
        Ok(bytes as f64 / (1024.0 * 1024.0))
    }

    pub fn estimate_mode(&self) -> Result<StorageMode> {
        let size_mb = self.blob_size_mb()?;
        let mode = mode_for(size_mb, self.ceiling_mb);
        debug!(size_mb, ceiling_mb = self.ceiling_mb, %mode, "storage mode estimated");
        Ok(mode)
    }

    /// Whether a backup is owed at `now`.
    ///
    /// A missing or unreadable marker counts as never backed up.
    pub fn backup_due(&self, now: Timestamp) -> Result<bool> {
        if !self.auto_backup {
            return Ok(false);
        }
        let last = self
            .store
            .get(keys::LAST_BACKUP)?
            .and_then(|v| v.trim().parse::<Timestamp>().ok());
        let Some(last) = last else {
            return Ok(true);
        };
        let elapsed_minutes = (now.as_millisecond() - last.as_millisecond()) / 60_000;
        Ok(elapsed_minutes >= i64::try_from(self.interval_minutes).unwrap_or(i64::MAX))
    }

    /// Backs the database up if one is due.
    ///
    /// Writes a dated database file into the backups directory, copies the
    /// stored blob to its backup key, then records the backup time. Returns
    /// the file written, or `None` when nothing was due.
    pub fn auto_backup(&self, engine: &Engine, now: Timestamp) -> Result<Option<PathBuf>> {
        if !self.backup_due(now)? {
            debug!("backup not due");
            return Ok(None);
        }

        fs::create_dir_all(&self.backup_dir).map_err(io_error(&self.backup_dir))?;
        let path = self.backup_dir.join(dated_file_name(now));
        let image = engine.export_image()?;
        fs::write(&path, &image).map_err(io_error(&path))?;

        if let Some(blob) = self.store.get(keys::ENGINE_BLOB)? {
            self.store.set(keys::ENGINE_BLOB_BACKUP, &blob)?;
            self.store.set(keys::BACKUP_TIME, &now.to_string())?;
        }
        self.store.set(keys::LAST_BACKUP, &now.to_string())?;

        let pruned = self.prune_backup_files()?;
        info!(path = %path.display(), bytes = image.len(), pruned, "backup written");
        Ok(Some(path))
    }

    /// Writes the raw database to `target`: a file path, or a directory to
    /// receive a dated file.
    pub fn export_to_file(&self, engine: &Engine, target: &Path, now: Timestamp) -> Result<PathBuf> {
        let path = if target.is_dir() {
            target.join(dated_file_name(now))
        } else {
            target.to_path_buf()
        };
        let image = engine.export_image()?;
        fs::write(&path, &image).map_err(io_error(&path))?;
        info!(path = %path.display(), bytes = image.len(), "database exported to file");
        Ok(path)
    }

    /// Replaces the engine's state with a database file.
    ///
    /// The stored blob is first copied to its backup key. The import time
    /// is recorded only once the new state is in place.
    pub fn import_from_file(&self, engine: &mut Engine, path: &Path) -> Result<()> {
        let image = fs::read(path).map_err(io_error(path))?;

        let now = Timestamp::now();
        if let Some(blob) = self.store.get(keys::ENGINE_BLOB)? {
            self.store.set(keys::ENGINE_BLOB_BACKUP, &blob)?;
            self.store.set(keys::BACKUP_TIME, &now.to_string())?;
        }

        if let Err(e) = engine.import_image(&image) {
            warn!(path = %path.display(), error = %e, "database file rejected");
            engine.log_error("import_from_file", &e.to_string(), None);
            if let Err(persist_err) = engine.persist() {
                warn!(error = %persist_err, "could not persist failure log");
            }
            return Err(e.into());
        }
        self.store.set(keys::LAST_IMPORT, &now.to_string())?;
        engine.log_event(
            "info",
            "database file imported",
            Some(serde_json::json!({ "path": path.display().to_string(), "bytes": image.len() })),
        );
        engine.persist()?;
        info!(path = %path.display(), bytes = image.len(), "database imported from file");
        Ok(())
    }

    /// Removes the backup and import markers. Never touches the engine blob
    /// or any entity key.
    pub fn cleanup(&self) -> Result<()> {
        self.store.clear(&keys::MARKER_KEYS)?;
        info!("storage markers cleared");
        Ok(())
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let size_mb = self.blob_size_mb()?;
        Ok(StorageStats {
            mode: mode_for(size_mb, self.ceiling_mb),
            size_mb,
            last_backup: self.store.get(keys::LAST_BACKUP)?,
            last_import: self.store.get(keys::LAST_IMPORT)?,
            has_backup: self.store.get(keys::ENGINE_BLOB_BACKUP)?.is_some(),
        })
    }

    /// Deletes all but the newest `max_backups` dated files.
    fn prune_backup_files(&self) -> Result<usize> {
        let entries = fs::read_dir(&self.backup_dir).map_err(io_error(&self.backup_dir))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == FILE_EXTENSION)
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(FILE_PREFIX))
            })
            .collect();
        // Dated names sort chronologically.
        files.sort();

        let excess = files.len().saturating_sub(self.max_backups);
        for path in &files[..excess] {
            fs::remove_file(path).map_err(io_error(path))?;
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::engine::tests::test_engine;
    use crate::model::sample_task;

    fn test_policy(store: Arc<dyn KvStore>) -> (TempDir, StoragePolicy) {
        let home = TempDir::new().unwrap();
        let policy = StoragePolicy::new(&Config::default(), home.path(), store);
        (home, policy)
    }

    fn at(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    #[test]
    fn mode_thresholds() {
        assert_eq!(mode_for(0.0, 5.0), StorageMode::LocalStore);
        assert_eq!(mode_for(3.99, 5.0), StorageMode::LocalStore);
        assert_eq!(mode_for(4.0, 5.0), StorageMode::Hybrid);
        assert_eq!(mode_for(5.0, 5.0), StorageMode::Hybrid);
        assert_eq!(mode_for(5.01, 5.0), StorageMode::File);
    }

    #[test]
    fn estimate_follows_blob_size() {
        let (store, _engine) = test_engine();
        let (_home, policy) = test_policy(store.clone());
        assert_eq!(policy.estimate_mode().unwrap(), StorageMode::LocalStore);

        store.set(keys::ENGINE_BLOB, &"x".repeat(4_500_000)).unwrap();
        assert_eq!(policy.estimate_mode().unwrap(), StorageMode::Hybrid);

        store.set(keys::ENGINE_BLOB, &"x".repeat(6_000_000)).unwrap();
        assert_eq!(policy.estimate_mode().unwrap(), StorageMode::File);
    }

    #[test]
    fn auto_backup_respects_interval() {
        let (store, mut engine) = test_engine();
        engine.upsert_task(&sample_task("t1")).unwrap();
        let (home, policy) = test_policy(store.clone());
        let first = at("2025-01-13T08:00:00Z");

        let path = policy.auto_backup(&engine, first).unwrap().unwrap();
        assert!(path.starts_with(home.path()));
        assert!(path.ends_with("production-kanban-2025-01-13.db"));
        assert!(path.exists());
        assert_eq!(store.get(keys::LAST_BACKUP).unwrap(), Some(first.to_string()));
        assert!(store.get(keys::ENGINE_BLOB_BACKUP).unwrap().is_some());

        assert!(policy.auto_backup(&engine, at("2025-01-13T08:59:00Z")).unwrap().is_none());
        assert!(policy.auto_backup(&engine, at("2025-01-13T09:00:00Z")).unwrap().is_some());
    }

    #[test]
    fn disabled_auto_backup_never_fires() {
        let (store, engine) = test_engine();
        let home = TempDir::new().unwrap();
        let config = Config {
            auto_backup: false,
            ..Config::default()
        };
        let policy = StoragePolicy::new(&config, home.path(), store.clone());

        assert!(policy.auto_backup(&engine, Timestamp::now()).unwrap().is_none());
        assert!(store.get(keys::LAST_BACKUP).unwrap().is_none());
    }

    #[test]
    fn old_backup_files_are_pruned() {
        let (store, engine) = test_engine();
        let home = TempDir::new().unwrap();
        let config = Config {
            max_backups: 2,
            ..Config::default()
        };
        let policy = StoragePolicy::new(&config, home.path(), store);

        for day in ["2025-01-10", "2025-01-11", "2025-01-12"] {
            let now = at(&format!("{day}T12:00:00Z"));
            policy.auto_backup(&engine, now).unwrap().unwrap();
        }

        let backups = config::backup_dir(home.path());
        let mut names: Vec<String> = fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(
            names,
            ["production-kanban-2025-01-11.db", "production-kanban-2025-01-12.db"]
        );
    }

    #[test]
    fn cleanup_keeps_primary_data() {
        let (store, mut engine) = test_engine();
        engine.upsert_task(&sample_task("t1")).unwrap();
        let (_home, policy) = test_policy(store.clone());
        policy.auto_backup(&engine, Timestamp::now()).unwrap();
        store.set(keys::LAST_IMPORT, "2025-01-01T00:00:00Z").unwrap();

        policy.cleanup().unwrap();

        for key in keys::MARKER_KEYS {
            assert!(store.get(key).unwrap().is_none(), "{key} survived");
        }
        assert!(store.get(keys::ENGINE_BLOB).unwrap().is_some());
    }

    #[test]
    fn file_export_then_import_replaces_state() {
        let (source_store, mut source) = test_engine();
        source.upsert_task(&sample_task("exported")).unwrap();
        let (dir, source_policy) = test_policy(source_store);
        let path = source_policy
            .export_to_file(&source, dir.path(), at("2025-03-01T10:00:00Z"))
            .unwrap();
        assert!(path.ends_with("production-kanban-2025-03-01.db"));

        let (store, mut target) = test_engine();
        target.upsert_task(&sample_task("local")).unwrap();
        let (_home, policy) = test_policy(store.clone());
        let before = store.get(keys::ENGINE_BLOB).unwrap();

        policy.import_from_file(&mut target, &path).unwrap();

        assert!(target.get_task("exported").unwrap().is_some());
        assert!(target.get_task("local").unwrap().is_none());
        assert_eq!(store.get(keys::ENGINE_BLOB_BACKUP).unwrap(), before);
        let stats = policy.stats().unwrap();
        assert!(stats.has_backup);
        assert!(stats.last_import.is_some());
    }

    #[test]
    fn bad_file_import_leaves_engine_alone() {
        let (store, mut engine) = test_engine();
        engine.upsert_task(&sample_task("kept")).unwrap();
        let (home, policy) = test_policy(store.clone());
        let path = home.path().join("not-a-database.db");
        fs::write(&path, b"hello".repeat(1000)).unwrap();

        assert!(policy.import_from_file(&mut engine, &path).is_err());
        assert!(engine.get_task("kept").unwrap().is_some());
        assert!(store.get(keys::LAST_IMPORT).unwrap().is_none());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let (store, mut engine) = test_engine();
        let (home, policy) = test_policy(store);
        let err = policy
            .import_from_file(&mut engine, &home.path().join("absent.db"))
            .unwrap_err();
        assert!(matches!(err, PolicyError::Io { .. }));
    }

    #[test]
    fn stats_on_a_fresh_store() {
        let (store, _engine) = test_engine();
        let (_home, policy) = test_policy(store);
        let stats = policy.stats().unwrap();

        assert_eq!(stats.mode, StorageMode::LocalStore);
        assert!(stats.size_mb < 0.01);
        assert!(!stats.has_backup);
        assert!(stats.last_backup.is_none());
    }
}
