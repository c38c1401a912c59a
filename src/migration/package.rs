//! Portable packages: every entity in one JSON document, for moving a
//! board to another machine or keeping a copy of it.

use jiff::Timestamp;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::engine::{Engine, RowWriteError};
use crate::model::{
    DEFAULT_COEFFICIENT, ImportPreset, ImportSettings, MasterAssignment, PORTABLE_PACKAGE_TYPE,
    PORTABLE_PACKAGE_VERSION, PackageData, PackageMetadata, PortablePackage, Task, UserSettings,
};

use super::{MigrationError, MigrationReport, Migrator, Result, backup, write_to_engine};

const MIGRATION_NOTES: [&str; 4] = [
    "This package holds the complete production board.",
    "It can be copied to removable media and opened on another machine.",
    "It is picked up and imported automatically at startup.",
    "Existing data is backed up before the import and is not lost.",
];

/// File name for a package exported on `now`'s date.
pub fn package_file_name(now: Timestamp) -> String {
    format!("production-kanban-package-{}.json", now.strftime("%Y-%m-%d"))
}

impl Migrator {
    /// Bundles every task, setting, learned assignment and import preset.
    ///
    /// Reads from the engine when there is one, otherwise from the
    /// key-value store. Returns the document and a dated file name.
    pub fn create_portable_package(
        &self,
        engine: Option<&Engine>,
        now: Timestamp,
    ) -> Result<(String, String)> {
        let data = match engine {
            Some(engine) => PackageData {
                tasks: engine.all_tasks()?,
                settings: engine.settings_map()?,
                master_assignments: engine.assignments()?,
                import_settings: engine.import_presets()?,
            },
            None => self.kv_contents()?,
        };
        let total_records = data.tasks.len()
            + data.settings.len()
            + data.master_assignments.len()
            + data.import_settings.len();
        let task_count = data.tasks.len();

        let package = PortablePackage {
            kind: PORTABLE_PACKAGE_TYPE.to_string(),
            version: PORTABLE_PACKAGE_VERSION.to_string(),
            export_time: now,
            data,
            metadata: PackageMetadata {
                total_records,
                original_source: self.host.clone(),
                migration_notes: MIGRATION_NOTES.iter().map(ToString::to_string).collect(),
            },
        };
        let json = serde_json::to_string_pretty(&package)?;
        let file_name = package_file_name(now);

        if let Some(engine) = engine {
            engine.log_event(
                "info",
                "portable package created",
                Some(serde_json::json!({
                    "taskCount": task_count,
                    "fileSize": json.len(),
                    "filename": file_name,
                })),
            );
        }
        info!(tasks = task_count, bytes = json.len(), "portable package created");
        Ok((json, file_name))
    }

    /// Imports a package document.
    ///
    /// Anything other than a portable package is rejected before any
    /// change is made. A snapshot of the current state is taken first; rows
    /// that cannot be read or written are reported and skipped.
    pub fn import_portable_package(
        &self,
        engine: Option<&mut Engine>,
        json: &str,
    ) -> Result<MigrationReport> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| MigrationError::ImportFormat(format!("not valid JSON: {e}")))?;
        self.import_package_value(engine, value)
    }

    pub(super) fn import_package_value(
        &self,
        engine: Option<&mut Engine>,
        value: Value,
    ) -> Result<MigrationReport> {
        let kind = value.get("type").and_then(Value::as_str);
        if kind != Some(PORTABLE_PACKAGE_TYPE) {
            return Err(MigrationError::ImportFormat(format!(
                "expected type {PORTABLE_PACKAGE_TYPE:?}, found {kind:?}"
            )));
        }
        let Some(body) = value.get("data").filter(|d| d.is_object()) else {
            return Err(MigrationError::ImportFormat("package has no data".into()));
        };

        let mut report = MigrationReport::default();
        let data = read_package_data(body, &mut report);
        let now = Timestamp::now();

        match engine {
            Some(engine) => {
                match backup::snapshot_engine(engine, &*self.store, self.keep_backups, now) {
                    Ok(key) => report.backup_key = Some(key),
                    Err(e) => report.fail("backup", &e),
                }
                write_to_engine(engine, &data, &mut report);
                engine.log_event(
                    if report.is_clean() { "info" } else { "warn" },
                    "portable package imported",
                    Some(serde_json::json!({
                        "report": report,
                        "sourceVersion": value.get("version"),
                        "exportTime": value.get("exportTime"),
                    })),
                );
                if let Err(e) = engine.persist() {
                    report.fail("persist", &e);
                }
            }
            None => {
                match backup::snapshot_store(&*self.store, self.keep_backups, now) {
                    Ok(key) => report.backup_key = Some(key),
                    Err(e) => report.fail("backup", &e),
                }
                self.write_to_store(data, &mut report);
            }
        }

        info!(
            records = report.total(),
            errors = report.errors.len() + report.row_errors.len(),
            "portable package imported"
        );
        Ok(report)
    }

    /// Merges package contents into the key-value entities, for when there
    /// is no engine.
    fn write_to_store(&self, data: PackageData, report: &mut MigrationReport) {
        if !data.tasks.is_empty() {
            let mut tasks = self.store.load_tasks();
            for task in data.tasks {
                if let Err(reason) = task.validate() {
                    report.row_errors.push(RowWriteError {
                        task_id: task.id,
                        reason,
                    });
                    continue;
                }
                match tasks.iter_mut().find(|t| t.id == task.id) {
                    Some(existing) => *existing = task,
                    None => tasks.push(task),
                }
                report.tasks_migrated += 1;
            }
            if let Err(e) = self.store.save_tasks(&tasks) {
                report.tasks_migrated = 0;
                report.fail("tasks", &e);
            }
        }

        let coefficient = ["default_coefficient", "coefficient"]
            .iter()
            .find_map(|key| data.settings.get(*key).and_then(Value::as_f64));
        if let Some(coefficient) = coefficient {
            match self.store.save_user_settings(&UserSettings { coefficient }) {
                Ok(()) => report.settings_migrated += 1,
                Err(e) => report.fail("settings", &e),
            }
        }

        if !data.master_assignments.is_empty() {
            let mut assignments = self.store.load_master_assignments();
            for incoming in &data.master_assignments {
                let key = (incoming.product_name.as_str(), incoming.product_code.as_deref());
                match assignments.iter_mut().find(|a| a.matches_key(key.0, key.1)) {
                    Some(existing) => *existing = incoming.clone(),
                    None => assignments.push(incoming.clone()),
                }
            }
            match self.store.save_master_assignments(&assignments) {
                Ok(()) => report.assignments_migrated += data.master_assignments.len(),
                Err(e) => report.fail("assignments", &e),
            }
        }

        // The key-value store keeps a single mapping: the default preset, or
        // the first one.
        let preset = data
            .import_settings
            .iter()
            .find(|p| p.is_default)
            .or_else(|| data.import_settings.first());
        if let Some(preset) = preset {
            match self.store.save_import_settings(&legacy_import_settings(preset)) {
                Ok(()) => report.presets_migrated += 1,
                Err(e) => report.fail("import presets", &e),
            }
        }
    }
}

fn legacy_import_settings(preset: &ImportPreset) -> ImportSettings {
    ImportSettings {
        column_mapping: preset.column_mapping.clone(),
        coefficient: preset.coefficient.unwrap_or(DEFAULT_COEFFICIENT),
        last_import_time: preset.last_used_at.clone(),
    }
}

/// Reads the package body row by row. Unreadable rows are reported and
/// left out.
fn read_package_data(body: &Value, report: &mut MigrationReport) -> PackageData {
    let tasks = read_rows::<Task>(body, "tasks", |row, e| {
        let task_id = row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>")
            .to_string();
        report.row_errors.push(RowWriteError {
            task_id,
            reason: e.to_string(),
        });
    });
    let master_assignments = read_rows::<MasterAssignment>(body, "masterAssignments", |_, e| {
        report.fail("assignment row", &e);
    });
    let import_settings = read_rows::<ImportPreset>(body, "importSettings", |_, e| {
        report.fail("import preset row", &e);
    });
    let settings = body
        .get("settings")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    PackageData {
        tasks,
        settings,
        master_assignments,
        import_settings,
    }
}

fn read_rows<T: DeserializeOwned>(
    body: &Value,
    field: &str,
    mut on_error: impl FnMut(&Value, serde_json::Error),
) -> Vec<T> {
    let Some(rows) = body.get(field).and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match serde_json::from_value(row.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(field, error = %e, "skipping unreadable package row");
                on_error(row, e);
                None
            }
        })
        .collect()
}
