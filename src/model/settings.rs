//! User settings and spreadsheet import presets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default work-hour coefficient applied to imported tasks.
pub const DEFAULT_COEFFICIENT: f64 = 1.2;

/// Settings kept in the key-value store when the engine is unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub coefficient: f64,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            coefficient: DEFAULT_COEFFICIENT,
        }
    }
}

/// Typed view over the engine's `settings` table.
///
/// Missing or unparsable rows read as their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub default_coefficient: f64,
    /// Minutes in a working day.
    pub work_hours_per_day: f64,
    pub auto_assign: bool,
    pub page_size: u32,
    /// Hours between automatic backups.
    pub backup_interval: f64,
    pub theme: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_coefficient: DEFAULT_COEFFICIENT,
            work_hours_per_day: 540.0,
            auto_assign: true,
            page_size: 50,
            backup_interval: 24.0,
            theme: "light".into(),
        }
    }
}

/// The kind of value a setting row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    String,
    Number,
    Boolean,
    Json,
}

impl SettingType {
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Number(_) => Self::Number,
            serde_json::Value::Bool(_) => Self::Boolean,
            _ => Self::Json,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "json",
        }
    }
}

/// The last-used import mapping, as older installations stored it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettings {
    /// Spreadsheet column name → task field.
    pub column_mapping: BTreeMap<String, String>,
    pub coefficient: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_import_time: Option<String>,
}

impl ImportSettings {
    /// Converts the single legacy mapping into a named default preset.
    pub fn into_preset(self) -> ImportPreset {
        ImportPreset {
            name: "default".into(),
            column_mapping: self.column_mapping,
            file_type: FileType::Excel,
            is_default: true,
            coefficient: Some(self.coefficient),
            last_used_at: self.last_import_time,
        }
    }
}

/// A named, reusable column mapping for spreadsheet imports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPreset {
    pub name: String,
    pub column_mapping: BTreeMap<String, String>,
    pub file_type: FileType,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Excel,
    Csv,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excel => "excel",
            Self::Csv => "csv",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("csv") {
            Self::Csv
        } else {
            Self::Excel
        }
    }
}
