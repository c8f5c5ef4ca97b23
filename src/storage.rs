//! Storage adapters for persisted client state.
//!
//! A [`Storage`] holds exactly one string value. The flag cache and the override map each get their
//! own instance, so clearing one never touches the other.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use crate::Result;

/// A single persisted string slot.
///
/// Implementations must be cheap to call: the flag cache reads and writes through the adapter on
/// every resolution. Reads never fail; an unreadable slot is reported as empty.
pub trait Storage: Send + Sync {
    /// Read the stored value. Returns `None` if nothing has been stored yet.
    fn get(&self) -> Option<String>;

    /// Replace the stored value.
    fn set(&self, value: &str) -> Result<()>;

    /// Remove the stored value.
    fn clear(&self) -> Result<()>;
}

/// In-memory storage. Nothing survives the process.
///
/// Clones share the same slot.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    value: Arc<RwLock<Option<String>>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Create a storage holding `value`.
    pub fn with_value(value: impl Into<String>) -> MemoryStorage {
        MemoryStorage {
            value: Arc::new(RwLock::new(Some(value.into()))),
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self) -> Option<String> {
        self.value
            .read()
            .expect("thread holding storage lock should not panic")
            .clone()
    }

    fn set(&self, value: &str) -> Result<()> {
        // Allocating before taking the lock to minimize lock span.
        let value = Some(value.to_owned());
        *self
            .value
            .write()
            .expect("thread holding storage lock should not panic") = value;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .value
            .write()
            .expect("thread holding storage lock should not panic") = None;
        Ok(())
    }
}

/// Storage backed by a single file on disk.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Create a storage that keeps its value in `path`. The file (and its parent directory) is
    /// created on first write.
    pub fn new(path: impl Into<PathBuf>) -> FileStorage {
        FileStorage { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn get(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(value) => Some(value),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                log::warn!(target: "flagwise",
                           path:display = self.path.display();
                           "failed to read storage file: {:?}", err);
                None
            }
        }
    }

    fn set(&self, value: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write to a sibling file first, so a crash mid-write never leaves a truncated blob.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{FileStorage, MemoryStorage, Storage};

    #[test]
    fn memory_storage_clones_share_slot() {
        let storage = MemoryStorage::new();
        let other = storage.clone();

        storage.set("value").unwrap();
        assert_eq!(other.get().as_deref(), Some("value"));

        other.clear().unwrap();
        assert_eq!(storage.get(), None);
    }

    #[test]
    fn file_storage_round_trips_value() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("cache.json"));

        assert_eq!(storage.get(), None);

        storage.set("{\"a\":1}").unwrap();
        assert_eq!(storage.get().as_deref(), Some("{\"a\":1}"));

        storage.set("{}").unwrap();
        assert_eq!(storage.get().as_deref(), Some("{}"));
    }

    #[test]
    fn file_storage_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("cache.json"));

        storage.clear().unwrap();
        storage.set("value").unwrap();
        storage.clear().unwrap();
        storage.clear().unwrap();

        assert_eq!(storage.get(), None);
        assert!(!storage.path().exists());
    }
}
