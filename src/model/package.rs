//! Export envelopes: the portable package and the database export file.
//!
//! Both are JSON documents tagged with a `type` string. Readers must reject
//! any document whose tag they do not recognize before looking further.

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use super::{ImportPreset, MasterAssignment, Task};

/// Type tag of a portable package.
pub const PORTABLE_PACKAGE_TYPE: &str = "portable_kanban_sqlite";

/// Envelope version written into new portable packages.
pub const PORTABLE_PACKAGE_VERSION: &str = "1.0.0";

/// Type tag of a database export file.
pub const DATABASE_EXPORT_TYPE: &str = "sqlite_database";

/// A self-contained bundle of every entity, for moving between machines
/// and for backups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortablePackage {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub export_time: Timestamp,
    pub data: PackageData,
    pub metadata: PackageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageData {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub master_assignments: Vec<MasterAssignment>,
    #[serde(default)]
    pub import_settings: Vec<ImportPreset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    pub total_records: usize,
    /// Host the package was produced on.
    pub original_source: String,
    pub migration_notes: Vec<String>,
}

/// The whole engine image, base64-encoded, with a summary of its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseExport {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub db_name: String,
    pub export_time: Timestamp,
    /// Base64 of the raw `SQLite` image.
    pub data: String,
    pub metadata: DatabaseExportMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseExportMetadata {
    pub tables: Vec<String>,
    pub record_counts: BTreeMap<String, i64>,
    /// Size of the decoded image in bytes.
    pub file_size: usize,
}
