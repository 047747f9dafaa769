//! In-memory [`LocalStorage`] for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{LocalStorage, StorageError, validate_key};

/// Shared in-memory blob map.
///
/// Clones share the same contents, so a test can hand one clone to an
/// engine, drop the engine, and start a new one on another clone to
/// simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl LocalStorage for InMemoryStorage {
    fn write(&self, key: &str, blob: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        self.blobs.lock().insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs.lock().remove(key);
        Ok(())
    }
}
