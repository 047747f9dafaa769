//! Persistence encoding for the offline queue.
//!
//! The outbox is stored as one blob holding a format version and a list of
//! individually postcard-encoded [`PendingSend`] records. Encoding records
//! separately means one unreadable record can be dropped without losing the
//! rest of the queue.

use serde::{Deserialize, Serialize};

use crate::delivery::PendingSend;

/// Current outbox blob format.
pub const OUTBOX_FORMAT_VERSION: u8 = 1;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The blob was written by an unknown format version.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
}

/// On-disk outbox layout.
#[derive(Debug, Serialize, Deserialize)]
struct OutboxBlob {
    version: u8,
    entries: Vec<Vec<u8>>,
}

/// Result of decoding an outbox blob.
#[derive(Debug, Default)]
pub struct DecodedOutbox {
    /// Records that decoded cleanly.
    pub entries: Vec<PendingSend>,
    /// Number of records that could not be decoded and were dropped.
    pub corrupt: usize,
}

/// Encodes a single [`PendingSend`] record.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the record cannot be serialized.
pub fn encode_pending(pending: &PendingSend) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(pending).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a single [`PendingSend`] record.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid record.
pub fn decode_pending(bytes: &[u8]) -> Result<PendingSend, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes the whole outbox.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if any record cannot be serialized.
pub fn encode_outbox<'a>(
    entries: impl IntoIterator<Item = &'a PendingSend>,
) -> Result<Vec<u8>, CodecError> {
    let entries = entries
        .into_iter()
        .map(encode_pending)
        .collect::<Result<Vec<_>, _>>()?;
    let blob = OutboxBlob {
        version: OUTBOX_FORMAT_VERSION,
        entries,
    };
    postcard::to_allocvec(&blob).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes an outbox blob, skipping records that fail to decode.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the outer blob is unreadable, or
/// `CodecError::UnsupportedVersion` for an unknown format version.
pub fn decode_outbox(bytes: &[u8]) -> Result<DecodedOutbox, CodecError> {
    let blob: OutboxBlob =
        postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))?;
    if blob.version != OUTBOX_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(blob.version));
    }

    let mut decoded = DecodedOutbox::default();
    for raw in &blob.entries {
        match decode_pending(raw) {
            Ok(entry) => decoded.entries.push(entry),
            Err(_) => decoded.corrupt += 1,
        }
    }
    Ok(decoded)
}
