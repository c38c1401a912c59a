//! In-process store, used by tests and by sessions that must not touch disk.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{KvError, KvStore, Result, check_quota};

/// Map-backed store with the same quota rules as [`super::DirStore`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    quota: u64,
}

impl MemoryStore {
    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|e| KvError::Io(std::io::Error::other(format!("store lock poisoned: {e}"))))
    }
}

impl Default for MemoryStore {
    /// Five megabytes, the usual browser allowance.
    fn default() -> Self {
        Self::with_quota(5 * 1024 * 1024)
    }
}

fn usage(entries: &BTreeMap<String, String>) -> u64 {
    entries.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.lock()?;
        let old_len = entries
            .get(key)
            .map_or(0, |v| (key.len() + v.len()) as u64);
        check_quota(key, value, usage(&entries), old_len, self.quota)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn quota_bytes(&self) -> u64 {
        self.quota
    }

    fn used_bytes(&self) -> Result<u64> {
        Ok(usage(&*self.lock()?))
    }
}
