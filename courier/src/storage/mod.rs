//! Durable key/value blobs for state that must survive process death.
//!
//! The offline queue is the only writer. Access is synchronous: a write
//! returns only after the blob is safely stored.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::InMemoryStorage;

/// Errors that can occur in local storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying file system failed.
    #[error("storage I/O error for key {key}: {source}")]
    Io {
        /// Key being accessed.
        key: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The key cannot be mapped to a storage location.
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    /// The backend refused the write.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous blob storage keyed by short names.
pub trait LocalStorage: Send + Sync {
    /// Replaces the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the blob could not be stored.
    fn write(&self, key: &str, blob: &[u8]) -> Result<(), StorageError>;

    /// Reads the blob stored under `key`, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the blob exists but cannot be read.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Deletes the blob under `key`. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the blob exists but cannot be removed.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Keys are plain file names: ASCII alphanumerics, `-`, `_` and `.`, not
/// starting with a dot.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
