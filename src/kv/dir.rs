//! Directory-backed store: one file per key.
//!
//! ```text
//! <root>/
//!   kanban_tasks          # JSON
//!   sqlite_db_data        # base64 engine blob
//!   ...
//! ```
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a failed write never leaves a half-written value behind.

use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use super::{KvError, KvStore, Result, check_quota};

/// File-per-key store rooted at a directory.
pub struct DirStore {
    root: PathBuf,
    quota: u64,
}

impl DirStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, quota: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, quota })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn entry_len(path: &Path, key: &str) -> Result<u64> {
        match fs::metadata(path) {
            Ok(meta) => Ok(key.len() as u64 + meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl KvStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        let old_len = Self::entry_len(&path, key)?;
        check_quota(key, value, self.used_bytes()?, old_len, self.quota)?;

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(value.as_bytes())?;
        tmp.persist(&path).map_err(|e| KvError::Io(e.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Temp files from in-flight writes start with a dot.
            if name.starts_with('.') {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    fn quota_bytes(&self) -> u64 {
        self.quota
    }

    fn used_bytes(&self) -> Result<u64> {
        let mut used = 0;
        for key in self.keys()? {
            used += Self::entry_len(&self.root.join(&key), &key)?;
        }
        Ok(used)
    }
}

/// Keys become file names, so only a conservative character set is allowed.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(KvError::InvalidKey(key.to_string()))
    }
}
