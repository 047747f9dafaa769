//! Failure taxonomy for message writes.
//!
//! Every [`RemoteError`] a store returns is classified into a
//! [`DeliveryError`], which decides whether the offline queue retries,
//! backs off harder, or gives up.

use crate::remote::RemoteError;

/// Why a delivery attempt (or the queue itself) failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Connectivity or server trouble; retried with backoff.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// The store refused the content; retrying will not help.
    #[error("content rejected: {0}")]
    PermanentContent(String),

    /// The store asked us to slow down; retried with a longer floor.
    #[error("write quota exceeded")]
    QuotaExceeded,

    /// Persisted queue state could not be read back.
    #[error("local storage corrupt: {0}")]
    StorageCorruption(String),
}

impl DeliveryError {
    /// Whether the queue should schedule another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::QuotaExceeded)
    }
}

impl From<RemoteError> for DeliveryError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(_) | RemoteError::Closed | RemoteError::Timeout => {
                Self::TransientNetwork(err.to_string())
            }
            RemoteError::QuotaExceeded => Self::QuotaExceeded,
            RemoteError::Rejected(reason) => Self::PermanentContent(reason),
            RemoteError::NotFound(_) => Self::PermanentContent(err.to_string()),
        }
    }
}
