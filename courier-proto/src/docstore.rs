//! Wire protocol between a document-store client and `courier-docstore`.
//!
//! Frames are postcard-encoded and sent as WebSocket binary messages. Every
//! request carries a client-chosen `request_id` that the server echoes in its
//! reply, so a client can have several writes outstanding on one socket.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::document::{ChangeEvent, DocumentId, Fields, Query};

/// Frames sent from a client to the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Create a document; the server assigns its id.
    Create {
        /// Correlates the reply.
        request_id: u64,
        /// Target collection.
        collection: String,
        /// Initial document contents.
        fields: Fields,
    },
    /// Merge `fields` into an existing document.
    Update {
        /// Correlates the reply.
        request_id: u64,
        /// Collection holding the document.
        collection: String,
        /// Document to change.
        doc_id: DocumentId,
        /// Fields to overwrite.
        fields: Fields,
    },
    /// Start a live query.
    ///
    /// The server replies with [`ServerFrame::Subscribed`] followed by one
    /// `Added` change per matching document, then streams further changes.
    Subscribe {
        /// Correlates the reply.
        request_id: u64,
        /// Documents to watch.
        query: Query,
    },
    /// Stop a live query.
    Unsubscribe {
        /// Id from [`ServerFrame::Subscribed`].
        subscription_id: u64,
    },
}

/// Why the store refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreErrorKind {
    /// Document content was refused; retrying will not help.
    Rejected,
    /// The client exceeded its write allowance; back off before retrying.
    QuotaExceeded,
    /// The target document does not exist.
    NotFound,
    /// The frame could not be decoded.
    Malformed,
}

/// Frames sent from the document store to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// A create succeeded.
    Created {
        /// Echoed request id.
        request_id: u64,
        /// Id assigned to the new document.
        doc_id: DocumentId,
    },
    /// An update succeeded.
    Updated {
        /// Echoed request id.
        request_id: u64,
    },
    /// A subscription is live.
    Subscribed {
        /// Echoed request id.
        request_id: u64,
        /// Id tagging subsequent [`ServerFrame::Change`] frames.
        subscription_id: u64,
    },
    /// A document matching a subscription changed.
    Change {
        /// Subscription the change belongs to.
        subscription_id: u64,
        /// The change itself.
        event: ChangeEvent,
    },
    /// A request failed.
    Error {
        /// Request that failed, `None` if the frame could not be read at all.
        request_id: Option<u64>,
        /// Failure class.
        kind: StoreErrorKind,
        /// Human-readable detail.
        reason: String,
    },
}

/// Encodes a [`ClientFrame`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_client(frame: &ClientFrame) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ClientFrame`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid frame.
pub fn decode_client(bytes: &[u8]) -> Result<ClientFrame, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`ServerFrame`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_server(frame: &ServerFrame) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ServerFrame`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid frame.
pub fn decode_server(bytes: &[u8]) -> Result<ServerFrame, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ChangeKind, FieldValue};
    use crate::message::Timestamp;

    fn sample_fields() -> Fields {
        let mut fields = Fields::new();
        fields.insert("status".into(), FieldValue::from("sent"));
        fields.insert(
            "sent_at".into(),
            FieldValue::Timestamp(Timestamp::from_millis(1_234)),
        );
        fields
    }

    #[test]
    fn create_frame_survives_the_wire() {
        let frame = ClientFrame::Create {
            request_id: 7,
            collection: "messages".into(),
            fields: sample_fields(),
        };
        let decoded = decode_client(&encode_client(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn subscribe_frame_keeps_its_filter() {
        let frame = ClientFrame::Subscribe {
            request_id: 1,
            query: Query::collection("messages").where_eq("conversation_id", "c-1"),
        };
        let ClientFrame::Subscribe { query, .. } =
            decode_client(&encode_client(&frame).unwrap()).unwrap()
        else {
            panic!("expected Subscribe");
        };
        assert_eq!(query.filter.unwrap().field, "conversation_id");
    }

    #[test]
    fn change_frame_carries_the_document() {
        let frame = ServerFrame::Change {
            subscription_id: 3,
            event: ChangeEvent {
                kind: ChangeKind::Modified,
                doc_id: DocumentId::new("doc-1"),
                fields: sample_fields(),
            },
        };
        let decoded = decode_server(&encode_server(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn error_frame_without_request_id() {
        let frame = ServerFrame::Error {
            request_id: None,
            kind: StoreErrorKind::Malformed,
            reason: "bad frame".into(),
        };
        let decoded = decode_server(&encode_server(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(decode_client(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(decode_server(&[]).is_err());
    }
}
