//! Core message types for Courier delivery tracking.
//!
//! A [`Message`] is the unit whose delivery is tracked. Its [`DeliveryStatus`]
//! moves along `Sending -> Sent -> Delivered -> Read`, with a side exit to
//! `Failed`. The transition rules live on [`DeliveryStatus`] so every
//! component (state machine, propagator, tests) agrees on them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::DocumentId;

/// Maximum allowed text body size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Local identifier for a message, based on UUID v7 for time-ordering.
///
/// Assigned on submit and written into the remote document, so the origin
/// device and the counterpart key the message by the same value. The remote
/// store's own document id is tracked separately in [`Message::remote_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses a hyphenated UUID string, as stored in documents.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a conversation (direct thread or group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(Uuid);

impl ConversationId {
    /// Creates a new conversation identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ConversationId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses a hyphenated UUID string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the author of a message (an account id in the surrounding app).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(String);

impl SenderId {
    /// Creates a sender identity from its account id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the account id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns this timestamp shifted forward by `delta`, saturating.
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let millis = u64::try_from(delta.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Reference to media stored elsewhere (upload handled outside this engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// MIME type, e.g. `audio/ogg`.
    pub mime: String,
    /// Location of the uploaded media.
    pub url: String,
    /// Size of the media object in bytes.
    pub size_bytes: u64,
}

/// Content of a message: inline text or a pointer to media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Plain text content.
    Text(String),
    /// Media uploaded out of band.
    Media(MediaRef),
}

/// Error returned when a message body fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text content is empty.
    #[error("message content is empty")]
    Empty,
    /// Text content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Media reference has no URL.
    #[error("media reference has no url")]
    MissingMediaUrl,
    /// Media reference has no MIME type.
    #[error("media reference has no mime type")]
    MissingMediaType,
}

impl MessageBody {
    /// Validates this body for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for empty or oversized text, or for a
    /// media reference without URL or MIME type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Text(text) => {
                if text.is_empty() {
                    return Err(ValidationError::Empty);
                }
                if text.len() > MAX_MESSAGE_SIZE {
                    return Err(ValidationError::TooLarge {
                        size: text.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }
            }
            Self::Media(media) => {
                if media.url.is_empty() {
                    return Err(ValidationError::MissingMediaUrl);
                }
                if media.mime.is_empty() {
                    return Err(ValidationError::MissingMediaType);
                }
            }
        }
        Ok(())
    }
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Submitted locally, not yet acknowledged by the remote store.
    Sending,
    /// Written to the remote store.
    Sent,
    /// Received by the counterpart's device.
    Delivered,
    /// Seen by the counterpart.
    Read,
    /// Gave up; only a user retry leaves this state.
    Failed,
}

impl DeliveryStatus {
    /// Position on the forward path, `None` for [`Self::Failed`].
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    /// Whether `self` is strictly further along the forward path than `other`.
    ///
    /// `Failed` is never ahead of, nor behind, anything.
    #[must_use]
    pub fn is_ahead_of(self, other: Self) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }

    /// Whether no automatic transition leaves this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }

    /// Whether `self -> next` is one of the permitted single-step transitions.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Sending, Self::Sent | Self::Failed)
                | (Self::Sent, Self::Delivered | Self::Read | Self::Failed)
                | (Self::Delivered, Self::Read)
                | (Self::Failed, Self::Sending)
        )
    }

    /// Lowercase name used in documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Parses the lowercase document representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Local identifier (also stored in the document).
    pub id: MessageId,
    /// Document id assigned by the remote store on first successful write.
    pub remote_id: Option<DocumentId>,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: SenderId,
    /// Content.
    pub body: MessageBody,
    /// Client wall-clock creation time.
    pub created_at: Timestamp,
    /// Current delivery status.
    pub status: DeliveryStatus,
    /// When the remote store acknowledged the write.
    pub sent_at: Option<Timestamp>,
    /// When the counterpart received it.
    pub delivered_at: Option<Timestamp>,
    /// When the counterpart read it.
    pub read_at: Option<Timestamp>,
    /// Failed write attempts since the last success or user retry.
    pub retry_count: u32,
}

impl Message {
    /// Creates a new outbound message in [`DeliveryStatus::Sending`].
    #[must_use]
    pub const fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: SenderId,
        body: MessageBody,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            remote_id: None,
            conversation_id,
            sender_id,
            body,
            created_at,
            status: DeliveryStatus::Sending,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            retry_count: 0,
        }
    }

    /// Latest timestamp recorded on the message, used as the lower bound
    /// for the next one so the `created <= sent <= delivered <= read`
    /// chain holds.
    #[must_use]
    pub fn latest_timestamp(&self) -> Timestamp {
        [self.sent_at, self.delivered_at, self.read_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, Timestamp::max)
    }
}
