//! The `settings` and `import_settings` tables.
//!
//! Setting values are stored as text next to a type tag: strings verbatim,
//! everything else as JSON.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};

use crate::model::{FileType, ImportPreset, SettingType, Settings};

use super::{Engine, EngineError, Result};

pub(super) fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn decode_value(raw: String, kind: &str) -> Value {
    if kind == SettingType::String.as_str() {
        return Value::String(raw);
    }
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn write_setting(conn: &Connection, key: &str, value: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value, type, updated_at)
         VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             type = excluded.type,
             updated_at = excluded.updated_at",
        params![key, encode_value(value), SettingType::of(value).as_str()],
    )?;
    Ok(())
}

fn write_preset(conn: &Connection, preset: &ImportPreset) -> Result<()> {
    let mapping = serde_json::to_string(&preset.column_mapping)?;
    if preset.is_default {
        conn.execute(
            "UPDATE import_settings SET is_default = 0 WHERE name != ?1",
            params![preset.name],
        )?;
    }
    conn.execute(
        "INSERT INTO import_settings
             (name, column_mapping, file_type, is_default, coefficient, last_used_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(name) DO UPDATE SET
             column_mapping = excluded.column_mapping,
             file_type = excluded.file_type,
             is_default = excluded.is_default,
             coefficient = excluded.coefficient,
             last_used_at = excluded.last_used_at",
        params![
            preset.name,
            mapping,
            preset.file_type.as_str(),
            preset.is_default,
            preset.coefficient,
            preset.last_used_at,
        ],
    )?;
    Ok(())
}

impl Engine {
    /// Writes one setting and persists.
    pub fn set_setting(&mut self, key: &str, value: &Value) -> Result<()> {
        let result = write_setting(&self.conn, key, value);
        self.logged("set_setting", result)?;
        self.persist()
    }

    /// Writes many settings in one transaction, then persists once.
    pub fn set_settings(&mut self, entries: &Map<String, Value>) -> Result<usize> {
        let result = self.in_transaction(|conn| {
            entries
                .iter()
                .try_for_each(|(key, value)| write_setting(conn, key, value))
        });
        self.logged("set_settings", result)?;
        self.persist()?;
        Ok(entries.len())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        let result = self
            .conn
            .query_row(
                "SELECT value, type FROM settings WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(EngineError::from);
        let row = self.logged("get_setting", result)?;
        Ok(row.map(|(raw, kind)| decode_value(raw, &kind)))
    }

    /// Every setting, decoded by its type tag.
    pub fn settings_map(&self) -> Result<Map<String, Value>> {
        self.logged("settings_map", query_settings(&self.conn))
    }

    /// Typed settings. Missing or unreadable rows take their defaults.
    pub fn settings(&self) -> Result<Settings> {
        let map = self.settings_map()?;
        let mut settings = Settings::default();

        if let Some(v) = map.get("default_coefficient").and_then(Value::as_f64) {
            settings.default_coefficient = v;
        }
        if let Some(v) = map.get("work_hours_per_day").and_then(Value::as_f64) {
            settings.work_hours_per_day = v;
        }
        if let Some(v) = map.get("auto_assign").and_then(Value::as_bool) {
            settings.auto_assign = v;
        }
        if let Some(v) = map
            .get("page_size")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
        {
            settings.page_size = v;
        }
        if let Some(v) = map.get("backup_interval").and_then(Value::as_f64) {
            settings.backup_interval = v;
        }
        if let Some(v) = map.get("theme").and_then(Value::as_str) {
            settings.theme = v.to_string();
        }
        Ok(settings)
    }

    /// Inserts or replaces a preset by name. A default preset clears the
    /// default flag on every other preset.
    pub fn save_import_preset(&mut self, preset: &ImportPreset) -> Result<()> {
        let result = write_preset(&self.conn, preset);
        self.logged("save_import_preset", result)?;
        self.persist()
    }

    /// Writes many presets in one transaction, then persists once.
    pub fn save_import_presets(&mut self, presets: &[ImportPreset]) -> Result<usize> {
        let result = self.in_transaction(|conn| {
            presets
                .iter()
                .try_for_each(|preset| write_preset(conn, preset))
        });
        self.logged("save_import_presets", result)?;
        self.persist()?;
        Ok(presets.len())
    }

    /// All presets, default first, then by name.
    pub fn import_presets(&self) -> Result<Vec<ImportPreset>> {
        self.logged("import_presets", query_presets(&self.conn))
    }
}

fn query_settings(conn: &Connection) -> Result<Map<String, Value>> {
    let mut stmt = conn.prepare("SELECT key, value, type FROM settings ORDER BY key")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut map = Map::new();
    for row in rows {
        let (key, raw, kind) = row?;
        map.insert(key, decode_value(raw, &kind));
    }
    Ok(map)
}

fn query_presets(conn: &Connection) -> Result<Vec<ImportPreset>> {
    let mut stmt = conn.prepare(
        "SELECT name, column_mapping, file_type, is_default, coefficient, last_used_at
         FROM import_settings
         ORDER BY is_default DESC, name",
    )?;
    let rows = stmt.query_map([], |row| {
        let mapping: String = row.get(1)?;
        let file_type: String = row.get(2)?;
        Ok(ImportPreset {
            name: row.get(0)?,
            column_mapping: serde_json::from_str::<BTreeMap<String, String>>(&mapping)
                .unwrap_or_default(),
            file_type: FileType::parse(&file_type),
            is_default: row.get(3)?,
            coefficient: row.get(4)?,
            last_used_at: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}
