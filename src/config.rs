//! Board configuration.
//!
//! Everything lives under one home directory, resolved through a chain:
//!
//! 1. `--home <dir>` on the command line
//! 2. `KANBAN_HOME` environment variable
//! 3. `~/.kanban`
//!
//! ```text
//! <home>/
//!   config.toml    # optional; every key has a default
//!   store/         # key-value store, one file per key
//!   backups/       # dated database files from automatic backups
//! ```

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::{Deserialize, Serialize};

use crate::model::{RosterEntry, default_roster};

/// Board configuration. A missing file, or a missing key, means the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Key-value store capacity, and the storage-mode ceiling, in megabytes.
    pub quota_mb: f64,
    pub backup_interval_minutes: u64,
    pub auto_backup: bool,
    /// Database snapshots (in the store and in `backups/`) kept before the
    /// oldest are pruned.
    pub max_backups: usize,
    /// Recorded as the origin of exported packages.
    pub host: String,
    pub roster: Vec<RosterEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quota_mb: 5.0,
            backup_interval_minutes: 60,
            auto_backup: true,
            max_backups: 5,
            host: default_host(),
            roster: default_roster(),
        }
    }
}

fn default_host() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Config {
    /// Loads `<home>/config.toml`, or the defaults when there is no file.
    pub fn load(home: &Path) -> Result<Self, String> {
        let path = Self::path(home);
        let contents = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(format!("failed to read {}: {e}", path.display())),
        };

        let config: Self = toml::from_str(&contents)
            .map_err(|e| format!("invalid config at {}: {e}", path.display()))?;

        if !(config.quota_mb.is_finite() && config.quota_mb > 0.0) {
            return Err(format!(
                "quota-mb must be positive in {}, got {}",
                path.display(),
                config.quota_mb
            ));
        }
        Ok(config)
    }

    pub fn path(home: &Path) -> PathBuf {
        home.join("config.toml")
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn quota_bytes(&self) -> u64 {
        (self.quota_mb * 1024.0 * 1024.0) as u64
    }
}

/// Resolves the home directory from the tiered chain.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf, String> {
    // 1. Explicit --home flag.
    if let Some(home) = explicit {
        return Ok(home.to_path_buf());
    }

    // 2. KANBAN_HOME environment variable.
    if let Ok(home) = env::var("KANBAN_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }

    // 3. ~/.kanban.
    dirs::home_dir()
        .map(|h| h.join(".kanban"))
        .ok_or_else(|| "could not determine home directory; pass --home or set KANBAN_HOME".into())
}

pub fn store_dir(home: &Path) -> PathBuf {
    home.join("store")
}

pub fn backup_dir(home: &Path) -> PathBuf {
    home.join("backups")
}
