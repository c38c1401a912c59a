//! Core data model for the production board.
//!
//! Tasks and masters are what the workshop sees; assignments are what the
//! board learns from them; packages are how all of it leaves the machine.

mod assignment;
mod master;
mod package;
mod settings;
mod task;

pub use assignment::{
    CONFIDENCE_STEP, INITIAL_CONFIDENCE, MasterAssignment, confidence_for_count,
    count_for_confidence, normalize_code,
};
pub use master::{Master, RosterEntry, default_roster};
pub use package::{
    DATABASE_EXPORT_TYPE, DatabaseExport, DatabaseExportMetadata, PORTABLE_PACKAGE_TYPE,
    PORTABLE_PACKAGE_VERSION, PackageData, PackageMetadata, PortablePackage,
};
pub use settings::{
    DEFAULT_COEFFICIENT, FileType, ImportPreset, ImportSettings, SettingType, Settings,
    UserSettings,
};
pub use task::{LEGACY_UNASSIGNED, Task, TaskStatus, UNASSIGNED, URGENT_PRIORITY, is_unassigned};

#[cfg(test)]
pub(crate) use task::sample_task;
