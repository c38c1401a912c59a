//! Migration orchestrator: moves data between storage tiers at startup and
//! on request.
//!
//! ```text
//! Idle → PortablePackageCheck → LocalToEngineCheck → EngineInit → Ready
//!                                                        ↓          ↑
//!                                                      Error ───────┘
//! ```
//!
//! A failing step degrades to fewer records moved, never to an abort. If
//! the engine cannot come up at all the board keeps running on the
//! key-value store alone.

mod backup;
mod detect;
mod package;

use std::fmt;
use std::sync::Arc;

use jiff::Timestamp;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::{Engine, EngineError, LoadOutcome, RowWriteError};
use crate::kv::{KvError, KvStore, keys};
use crate::model::{PackageData, RosterEntry};

pub use detect::{DetectedPackage, PORTABLE_PARAM, PackageSource};
pub use package::package_file_name;

/// Errors that can occur during migration and package import.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("import rejected: {0}")]
    ImportFormat(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, MigrationError>;

/// A step of the startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    PortablePackageCheck,
    LocalToEngineCheck,
    EngineInit,
    Ready,
    /// The engine is unusable; storage falls back to the key-value store.
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::PortablePackageCheck => "portable package check",
            Self::LocalToEngineCheck => "local to engine check",
            Self::EngineInit => "engine init",
            Self::Ready => "ready",
            Self::Error => "error",
        })
    }
}

/// Whether key-value data should be moved into the engine, and why.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCheck {
    pub needs_migration: bool,
    pub has_kv_data: bool,
    pub has_engine_data: bool,
    pub kv_count: usize,
    pub engine_count: usize,
}

/// What a migration or package import moved, and what it could not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub tasks_migrated: usize,
    pub settings_migrated: usize,
    pub assignments_migrated: usize,
    pub presets_migrated: usize,
    /// Step-level failures, one line each.
    pub errors: Vec<String>,
    pub row_errors: Vec<RowWriteError>,
    /// Key of the safety snapshot this run left behind.
    pub backup_key: Option<String>,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.tasks_migrated + self.settings_migrated + self.assignments_migrated + self.presets_migrated
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.row_errors.is_empty()
    }

    fn fail(&mut self, step: &str, error: &dyn fmt::Display) {
        warn!(step, %error, "migration step failed");
        self.errors.push(format!("{step}: {error}"));
    }
}

/// How startup went.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub phases: Vec<Phase>,
    pub load: Option<LoadOutcome>,
    pub package: Option<(PackageSource, MigrationReport)>,
    pub migration: Option<MigrationReport>,
    /// The engine is unavailable and the key-value store holds everything.
    pub degraded: bool,
    pub errors: Vec<String>,
}

pub struct Migrator {
    store: Arc<dyn KvStore>,
    roster: Vec<RosterEntry>,
    host: String,
    keep_backups: usize,
}

impl Migrator {
    pub fn new(config: &Config, store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            roster: config.roster.clone(),
            host: config.host.clone(),
            keep_backups: config.max_backups,
        }
    }

    /// Compares task counts between the tiers.
    ///
    /// Only counts are compared, never contents: an engine holding at least
    /// as many tasks as the key-value list is taken to be current.
    pub fn check(&self, engine: Option<&Engine>) -> MigrationCheck {
        let kv_count = self.store.load_tasks().len();
        let engine_count = match engine {
            Some(engine) if engine.is_initialized() => engine.count_tasks().unwrap_or_else(|e| {
                warn!(error = %e, "could not count engine tasks");
                0
            }),
            _ => 0,
        };
        let initialized = engine.is_some_and(Engine::is_initialized);
        let has_kv_data = kv_count > 0;
        let has_engine_data = engine_count > 0;

        MigrationCheck {
            needs_migration: has_kv_data && (!initialized || engine_count < kv_count),
            has_kv_data,
            has_engine_data,
            kv_count,
            engine_count,
        }
    }

    pub fn should_migrate(&self, engine: Option<&Engine>) -> bool {
        self.check(engine).needs_migration
    }

    /// Copies every key-value entity into the engine.
    ///
    /// Each step runs whether or not the previous one failed. The key-value
    /// entities are always snapshotted under a `kanban_backup_<millis>` key
    /// before returning.
    pub fn migrate(&self, engine: &mut Engine) -> MigrationReport {
        let mut report = MigrationReport::default();
        info!("migrating key-value data into the engine");

        match self.kv_contents() {
            Ok(data) => write_to_engine(engine, &data, &mut report),
            Err(e) => report.fail("read", &e),
        }

        match backup::snapshot_store(&*self.store, self.keep_backups, Timestamp::now()) {
            Ok(key) => report.backup_key = Some(key),
            Err(e) => report.fail("backup", &e),
        }

        engine.log_event(
            if report.is_clean() { "info" } else { "warn" },
            "key-value data migrated",
            serde_json::to_value(&report).ok(),
        );
        if let Err(e) = engine.persist() {
            report.fail("persist", &e);
        }
        info!(
            tasks = report.tasks_migrated,
            settings = report.settings_migrated,
            assignments = report.assignments_migrated,
            presets = report.presets_migrated,
            errors = report.errors.len(),
            "migration finished"
        );
        report
    }

    /// Migrates only when [`Migrator::check`] says it is needed.
    pub fn auto_migrate(&self, engine: &mut Engine) -> Option<MigrationReport> {
        let check = self.check(Some(&*engine));
        if !check.needs_migration {
            return None;
        }
        info!(
            kv = check.kv_count,
            engine = check.engine_count,
            "key-value store holds more tasks than the engine"
        );
        Some(self.migrate(engine))
    }

    /// Brings storage up: opens the engine, takes in any waiting portable
    /// package, migrates key-value data if needed.
    ///
    /// Always ends in [`Phase::Ready`]. The engine is `None` when it could
    /// not be brought up, and the report is then marked degraded.
    pub fn startup(&self, url_query: Option<&str>) -> (Option<Engine>, StartupReport) {
        let mut report = StartupReport {
            phases: vec![Phase::Idle],
            ..StartupReport::default()
        };

        let mut engine = match self.open_engine() {
            Ok((engine, outcome)) => {
                report.load = Some(outcome);
                Some(engine)
            }
            Err(e) => {
                error!(error = %e, "engine unavailable");
                report.errors.push(format!("engine: {e}"));
                None
            }
        };

        report.phases.push(Phase::PortablePackageCheck);
        if let Some(detected) = self.detect_portable_package(url_query) {
            info!(source = %detected.source, "portable package found");
            match self.import_package_value(engine.as_mut(), detected.package) {
                Ok(imported) => {
                    if detected.source == PackageSource::Store
                        && let Err(e) = self.store.remove(keys::PORTABLE_PACKAGE)
                    {
                        warn!(error = %e, "could not clear portable package key");
                    }
                    report.package = Some((detected.source, imported));
                }
                Err(e) => {
                    warn!(error = %e, "portable package import failed");
                    report.errors.push(format!("package: {e}"));
                }
            }
        } else {
            report.phases.push(Phase::LocalToEngineCheck);
            if let Some(engine) = engine.as_mut() {
                report.migration = self.auto_migrate(engine);
            }
        }

        report.phases.push(Phase::EngineInit);
        if let Some(current) = engine.as_mut()
            && let Err(e) = current.initialize()
        {
            error!(error = %e, "engine failed to initialize");
            report.errors.push(format!("engine: {e}"));
            engine = None;
        }
        if engine.is_none() {
            warn!("continuing on the key-value store alone");
            report.phases.push(Phase::Error);
            report.degraded = true;
        }

        report.phases.push(Phase::Ready);
        (engine, report)
    }

    fn open_engine(&self) -> Result<(Engine, LoadOutcome)> {
        let mut engine = Engine::open(Some(self.store.clone()), self.roster.clone())?;
        let outcome = engine.load_from_store()?;
        Ok((engine, outcome))
    }

    /// Everything the key-value store holds, in package form.
    fn kv_contents(&self) -> core::result::Result<PackageData, KvError> {
        let mut settings = serde_json::Map::new();
        if self.store.get(keys::SETTINGS)?.is_some() {
            let user = self.store.load_user_settings();
            settings.insert("default_coefficient".into(), user.coefficient.into());
        }
        Ok(PackageData {
            tasks: self.store.load_tasks(),
            settings,
            master_assignments: self.store.load_master_assignments(),
            import_settings: self
                .store
                .load_import_settings()
                .map(|legacy| vec![legacy.into_preset()])
                .unwrap_or_default(),
        })
    }
}

/// Writes package contents into the engine, one entity kind at a time.
fn write_to_engine(engine: &mut Engine, data: &PackageData, report: &mut MigrationReport) {
    // ── Tasks ──
    if !data.tasks.is_empty() {
        match engine.upsert_tasks_batch(&data.tasks) {
            Ok(outcome) => {
                report.tasks_migrated += outcome.written;
                report.row_errors.extend(outcome.errors);
            }
            Err(e) => report.fail("tasks", &e),
        }
    }

    // ── Settings ──
    if !data.settings.is_empty() {
        match engine.set_settings(&data.settings) {
            Ok(n) => report.settings_migrated += n,
            Err(e) => report.fail("settings", &e),
        }
    }

    // ── Assignments ──
    if !data.master_assignments.is_empty() {
        match engine.upsert_assignments(&data.master_assignments) {
            Ok(n) => report.assignments_migrated += n,
            Err(e) => report.fail("assignments", &e),
        }
    }

    // ── Import presets ──
    if !data.import_settings.is_empty() {
        match engine.save_import_presets(&data.import_settings) {
            Ok(n) => report.presets_migrated += n,
            Err(e) => report.fail("import presets", &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::tests::test_engine;
    use crate::kv::MemoryStore;
    use crate::model::{ImportSettings, MasterAssignment, UserSettings, sample_task};

    pub(super) fn test_migrator() -> (Arc<dyn KvStore>, Migrator) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::with_quota(16 * 1024 * 1024));
        let migrator = Migrator::new(&Config::default(), store.clone());
        (store, migrator)
    }

    fn seed_kv(store: &dyn KvStore) {
        let tasks: Vec<_> = ["a", "b", "c"].into_iter().map(sample_task).collect();
        store.save_tasks(&tasks).unwrap();
        store.save_user_settings(&UserSettings { coefficient: 1.5 }).unwrap();
        store
            .save_master_assignments(&[MasterAssignment {
                product_name: "Valve-Body".into(),
                product_code: Some("V1".into()),
                master_name: "Pan Min".into(),
                confidence: 0.5,
                last_assigned_time: None,
            }])
            .unwrap();
        store
            .save_import_settings(&ImportSettings {
                column_mapping: [("产品名称".to_string(), "productName".to_string())].into(),
                coefficient: 1.3,
                last_import_time: None,
            })
            .unwrap();
    }

    #[test]
    fn check_compares_counts_only() {
        let (store, migrator) = test_migrator();
        store.save_tasks(&[sample_task("kv-1"), sample_task("kv-2")]).unwrap();
        let (_engine_store, mut engine) = test_engine();

        let check = migrator.check(Some(&engine));
        assert!(check.needs_migration);
        assert_eq!((check.kv_count, check.engine_count), (2, 0));

        // Different tasks, same count: nothing to do.
        engine.upsert_task(&sample_task("db-1")).unwrap();
        engine.upsert_task(&sample_task("db-2")).unwrap();
        assert!(!migrator.should_migrate(Some(&engine)));
    }

    #[test]
    fn empty_kv_never_needs_migration() {
        let (_store, migrator) = test_migrator();
        assert!(!migrator.should_migrate(None));
        let (_engine_store, engine) = test_engine();
        assert!(!migrator.should_migrate(Some(&engine)));
    }

    #[test]
    fn uninitialized_engine_needs_migration() {
        let (store, migrator) = test_migrator();
        store.save_tasks(&[sample_task("kv-1")]).unwrap();
        let engine = Engine::open(None, Vec::new()).unwrap();

        assert!(migrator.should_migrate(Some(&engine)));
        assert!(migrator.should_migrate(None));
    }

    #[test]
    fn migrate_moves_every_entity_and_snapshots() {
        let (store, migrator) = test_migrator();
        seed_kv(&*store);
        let (_engine_store, mut engine) = test_engine();

        let report = migrator.migrate(&mut engine);

        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.tasks_migrated, 3);
        assert_eq!(report.settings_migrated, 1);
        assert_eq!(report.assignments_migrated, 1);
        assert_eq!(report.presets_migrated, 1);
        assert_eq!(engine.count_tasks().unwrap(), 3);
        assert!((engine.settings().unwrap().default_coefficient - 1.5).abs() < f64::EPSILON);
        assert_eq!(engine.assignments().unwrap()[0].master_name, "Pan Min");
        assert_eq!(engine.import_presets().unwrap()[0].name, "default");

        let key = report.backup_key.unwrap();
        assert!(key.starts_with(keys::KV_BACKUP_PREFIX));
        assert!(store.get(&key).unwrap().unwrap().contains("\"tasks\""));
        assert!(
            engine
                .recent_logs(5)
                .unwrap()
                .iter()
                .any(|l| l.message == "key-value data migrated")
        );
    }

    #[test]
    fn bad_rows_do_not_stop_later_steps() {
        let (store, migrator) = test_migrator();
        seed_kv(&*store);
        let mut tasks = store.load_tasks();
        tasks[1].work_hours = 0.0;
        store.save_tasks(&tasks).unwrap();
        let (_engine_store, mut engine) = test_engine();

        let report = migrator.migrate(&mut engine);

        assert_eq!(report.tasks_migrated, 2);
        assert_eq!(report.row_errors.len(), 1);
        assert_eq!(report.row_errors[0].task_id, "b");
        assert_eq!(report.assignments_migrated, 1);
        assert!(report.backup_key.is_some());
    }

    #[test]
    fn auto_migrate_skips_when_current() {
        let (store, migrator) = test_migrator();
        store.save_tasks(&[sample_task("a")]).unwrap();
        let (_engine_store, mut engine) = test_engine();

        assert!(migrator.auto_migrate(&mut engine).is_some());
        assert!(migrator.auto_migrate(&mut engine).is_none());
    }

    #[test]
    fn startup_migrates_kv_data() {
        let (store, migrator) = test_migrator();
        seed_kv(&*store);

        let (engine, report) = migrator.startup(None);

        let engine = engine.unwrap();
        assert!(!report.degraded);
        assert_eq!(
            report.phases,
            [
                Phase::Idle,
                Phase::PortablePackageCheck,
                Phase::LocalToEngineCheck,
                Phase::EngineInit,
                Phase::Ready
            ]
        );
        assert_eq!(report.load, Some(LoadOutcome::Fresh));
        assert_eq!(report.migration.unwrap().tasks_migrated, 3);
        assert_eq!(engine.count_tasks().unwrap(), 3);

        // The next start finds the persisted engine and has nothing to move.
        let (_engine, again) = migrator.startup(None);
        assert_eq!(again.load, Some(LoadOutcome::Restored));
        assert!(again.migration.is_none());
    }

    #[test]
    fn startup_with_corrupt_engine_blob_starts_fresh() {
        let (store, migrator) = test_migrator();
        store.set(keys::ENGINE_BLOB, "!!! not base64 !!!").unwrap();

        let (engine, report) = migrator.startup(None);

        assert!(engine.is_some());
        assert!(!report.degraded);
        assert!(matches!(report.load, Some(LoadOutcome::Replaced { .. })));
    }
}
