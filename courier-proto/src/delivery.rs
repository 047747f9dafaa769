//! Work items exchanged between the state machine, the offline queue and the
//! status propagator.

use serde::{Deserialize, Serialize};

use crate::document::DocumentId;
use crate::message::{DeliveryStatus, Message, MessageId, Timestamp};

/// Queue entry for a message not yet acknowledged by the remote store.
///
/// Owned by the offline queue and persisted to local storage on every
/// change so it survives process death.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    /// Snapshot of the message at enqueue time.
    pub message: Message,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Earliest time the next attempt may run.
    pub next_retry_at: Timestamp,
    /// When the entry entered the queue.
    pub queued_at: Timestamp,
}

impl PendingSend {
    /// Creates an entry that is due immediately.
    #[must_use]
    pub const fn new(message: Message, now: Timestamp) -> Self {
        Self {
            message,
            attempts: 0,
            next_retry_at: now,
            queued_at: now,
        }
    }

    /// The message id this entry belongs to.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Whether the entry may be attempted at `now`.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_retry_at <= now
    }
}

/// Write priority of a [`StatusUpdate`].
///
/// Ordered so that `High > Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Any message other than the newest in its conversation.
    Normal,
    /// The newest message in its conversation.
    High,
}

/// A requested remote mutation of one message's status field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Local message id, used for coalescing.
    pub message_id: MessageId,
    /// Document to mutate.
    pub remote_id: DocumentId,
    /// Status to write.
    pub target: DeliveryStatus,
    /// Flush ordering priority.
    pub priority: Priority,
    /// When the update was first queued; orders the flush.
    pub enqueued_at: Timestamp,
    /// When the message reached `target` locally; written as the remote
    /// `delivered_at` or `read_at`.
    pub changed_at: Timestamp,
}
