//! The database export file: the raw image, base64-encoded, in a tagged
//! JSON envelope.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use jiff::Timestamp;
use tracing::info;

use crate::kv::keys;
use crate::model::{DATABASE_EXPORT_TYPE, DatabaseExport, DatabaseExportMetadata};

use super::{DB_NAME, Engine, EngineError, Result, SCHEMA_VERSION, blob};

impl Engine {
    /// Serializes the whole database into an export document.
    pub fn export_database(&self) -> Result<String> {
        let image = self.export_image()?;
        let export = DatabaseExport {
            kind: DATABASE_EXPORT_TYPE.to_string(),
            version: SCHEMA_VERSION,
            db_name: DB_NAME.to_string(),
            export_time: Timestamp::now(),
            data: BASE64.encode(&image),
            metadata: DatabaseExportMetadata {
                tables: self.table_names()?,
                record_counts: self.record_counts()?,
                file_size: image.len(),
            },
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Replaces the database with the contents of an export document.
    ///
    /// The document is fully checked before anything changes. The current
    /// state is then saved under a `sqlite_backup_<millis>` key, keeping the
    /// newest `keep_backups` of them.
    pub fn import_database(&mut self, json: &str, keep_backups: usize) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| EngineError::ImportFormat(format!("not valid JSON: {e}")))?;
        let kind = value.get("type").and_then(serde_json::Value::as_str);
        if kind != Some(DATABASE_EXPORT_TYPE) {
            return Err(EngineError::ImportFormat(format!(
                "expected type {DATABASE_EXPORT_TYPE:?}, found {kind:?}"
            )));
        }
        let export: DatabaseExport = serde_json::from_value(value)
            .map_err(|e| EngineError::ImportFormat(e.to_string()))?;
        let image = BASE64
            .decode(export.data.trim())
            .map_err(|e| EngineError::ImportFormat(format!("data is not base64: {e}")))?;

        blob::check_image(&image)
            .map_err(|e| EngineError::ImportFormat(format!("data is not a database: {e}")))?;

        let now = Timestamp::now();
        let store = self.store().cloned();
        if let Some(store) = &store {
            let key = keys::timestamped(keys::ENGINE_BACKUP_PREFIX, now.as_millisecond());
            store.set(&key, &self.export_database()?)?;
            store.prune_prefix(keys::ENGINE_BACKUP_PREFIX, keep_backups)?;
        }

        let restored = self.import_image(&image);
        self.logged("import_database", restored)?;
        if let Some(store) = &store {
            store.set(keys::LAST_IMPORT, &now.to_string())?;
        }
        info!(bytes = image.len(), "database imported");
        self.log_event(
            "info",
            "database imported",
            Some(serde_json::json!({
                "dbName": export.db_name,
                "version": export.version,
                "exportTime": export.export_time,
            })),
        );
        self.persist()
    }
}
