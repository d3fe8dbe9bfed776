//! Raw key-value backends.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::StoreError;

/// Bytes an entry occupies against a quota.
///
/// Keys count too, mirroring how browser-style storage quotas are charged.
pub fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// A synchronous string key-value backend.
///
/// Implementations must be cheap to call from non-async code; the caches
/// persist on every mutation and never await a write.
pub trait KeyValueBackend: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one.
    ///
    /// Returns [`StoreError::QuotaExceeded`] when the write does not fit.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// List all stored keys.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Byte quota, if the backend enforces one.
    fn quota(&self) -> Option<usize>;

    /// Remove every key.
    fn clear(&self) -> Result<(), StoreError> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Total bytes currently charged against the quota.
    fn used_bytes(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        for key in self.keys()? {
            if let Some(value) = self.get(&key)? {
                total += entry_size(&key, &value);
            }
        }
        Ok(total)
    }
}

struct MemoryInner {
    entries: BTreeMap<String, String>,
    quota: Option<usize>,
}

/// In-memory backend with an optional byte quota.
///
/// Used for tests and for sessions that should leave nothing on disk.
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    /// Create an unbounded backend.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: BTreeMap::new(),
                quota: None,
            }),
        }
    }

    /// Create a backend that rejects writes above `quota` bytes.
    pub fn with_quota(quota: usize) -> Self {
        let backend = Self::new();
        backend.set_quota(Some(quota));
        backend
    }

    /// Change the quota. Existing entries are kept even if they exceed it.
    pub fn set_quota(&self, quota: Option<usize>) {
        self.lock().quota = quota;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned map is still a consistent map; every mutation is a single insert/remove.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(quota) = inner.quota {
            let used: usize = inner
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| entry_size(k, v))
                .sum();
            let needed = entry_size(key, value);
            if used + needed > quota {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        inner.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().entries.keys().cloned().collect())
    }

    fn quota(&self) -> Option<usize> {
        self.lock().quota
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.lock().entries.clear();
        Ok(())
    }

    fn used_bytes(&self) -> Result<usize, StoreError> {
        Ok(self
            .lock()
            .entries
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum())
    }
}
