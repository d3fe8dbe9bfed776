//! File-backed key-value storage.
//!
//! Each key is one `<key>.json` file inside the data directory. Writes go
//! through a hidden temp file, `fsync`, then an atomic rename, so a crash
//! mid-write leaves the previous value intact.

use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::backend::{KeyValueBackend, entry_size};
use crate::StoreError;

const FILE_SUFFIX: &str = ".json";

/// Key-value backend storing one JSON file per key.
pub struct FileBackend {
    dir: PathBuf,
    quota: Option<usize>,
    /// Serializes writers so quota accounting sees a stable directory.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Open (or create) a backend rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(path = %dir.display(), "opened file store");
        Ok(Self {
            dir,
            quota: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Enforce a byte quota on the directory's entries.
    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Directory holding the entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}{FILE_SUFFIX}")))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{key}{FILE_SUFFIX}.tmp"))
    }
}

/// Keys become file names, so only a conservative alphabet is allowed.
fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(quota) = self.quota {
            let mut used = 0;
            for other in self.keys()? {
                if other == key {
                    continue;
                }
                if let Some(existing) = self.get(&other)? {
                    used += entry_size(&other, &existing);
                }
            }
            let needed = entry_size(key, value);
            if used + needed > quota {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        let tmp_path = self.temp_path_for(key);
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(value.as_bytes())?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, &path)?;
        trace!(key, bytes = value.len(), "file store: entry written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Hidden files are in-flight temp writes
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(FILE_SUFFIX)
                && validate_key(key).is_ok()
            {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn quota(&self) -> Option<usize> {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend.set("posts", r#"[{"id":"1"}]"#).unwrap();
        assert_eq!(
            backend.get("posts").unwrap().as_deref(),
            Some(r#"[{"id":"1"}]"#)
        );
        assert_eq!(backend.keys().unwrap(), vec!["posts".to_string()]);

        backend.remove("posts").unwrap();
        assert!(backend.get("posts").unwrap().is_none());
        // Removing twice is fine
        backend.remove("posts").unwrap();
    }

    #[test]
    fn test_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.set("auth", r#"{"id":"u1"}"#).unwrap();
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(
            backend.get("auth").unwrap().as_deref(),
            Some(r#"{"id":"u1"}"#)
        );
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        for key in ["", "../escape", "a/b", "with space", "dots.json"] {
            assert!(
                matches!(backend.set(key, "x"), Err(StoreError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_file_quota() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap().with_quota(32);

        backend.set("a", "0123456789").unwrap();
        let err = backend.set("b", &"x".repeat(40)).unwrap_err();
        assert!(err.is_quota());
        assert!(backend.get("b").unwrap().is_none());
        assert_eq!(backend.used_bytes().unwrap(), entry_size("a", "0123456789"));
    }

    #[test]
    fn test_temp_files_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        fs::write(dir.path().join(".posts.json.tmp"), "partial").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert!(backend.keys().unwrap().is_empty());
    }
}
