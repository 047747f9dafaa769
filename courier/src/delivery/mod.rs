//! Delivery state machine.
//!
//! [`StateMachine`] holds the authoritative status of every message this
//! device knows about. It performs no I/O: every operation takes the current
//! time and returns an [`Outcome`] listing the status changes it made and
//! the [`Effect`]s the caller must carry out (queue a write, cancel one,
//! propagate a receipt). [`tracker::DeliveryTracker`] wraps it with locking,
//! observers and the channels to the other workers.
//!
//! Messages authored here are [`Direction::Outbound`]; their status moves on
//! queue reports and on what the change feed says the counterpart wrote.
//! Messages learned from the change feed are [`Direction::Inbound`]; this
//! device is the one that marks them delivered and read.

pub mod tracker;

use std::collections::HashMap;
use std::time::Duration;

use courier_proto::delivery::{PendingSend, Priority, StatusUpdate};
use courier_proto::document::{ChangeEvent, ChangeKind, DocumentId};
use courier_proto::message::{
    ConversationId, DeliveryStatus, Message, MessageBody, MessageId, SenderId, Timestamp,
    ValidationError,
};
use courier_proto::schema::{self, RemoteMessage, SchemaError};

pub use tracker::{DeliveryTracker, MessageHandle, Report, StatusObserver};

/// Who authored a tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Authored on this device's account.
    Outbound,
    /// Authored by the counterpart.
    Inbound,
}

/// Why a message ended in [`DeliveryStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Every allowed attempt failed.
    RetriesExhausted,
    /// The store refused the content.
    Rejected(String),
    /// The message sat in `sending` past the stale timeout.
    StaleTimeout,
}

/// A message plus the bookkeeping the state machine keeps for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    /// Current message state.
    pub message: Message,
    /// Who authored it.
    pub direction: Direction,
    /// When it last entered `sending` in this process.
    pub sending_since: Option<Timestamp>,
    /// Set while the message is failed.
    pub failure: Option<FailureReason>,
}

/// One status change, as published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChanged {
    /// Message that changed.
    pub message_id: MessageId,
    /// Its conversation.
    pub conversation_id: ConversationId,
    /// Who authored it.
    pub direction: Direction,
    /// Previous status, `None` when the message was first tracked.
    pub from: Option<DeliveryStatus>,
    /// New status.
    pub to: DeliveryStatus,
    /// When the change took effect.
    pub at: Timestamp,
    /// Failed attempts recorded at the time of the change.
    pub retry_count: u32,
}

/// Work the caller must carry out after a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Hand a new entry to the offline queue.
    Enqueue(PendingSend),
    /// Remove the message's entry from the offline queue.
    Dequeue(MessageId),
    /// Write a status update to the remote store.
    Propagate(StatusUpdate),
}

/// Result of one state machine operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Status changes, in the order they happened.
    pub changes: Vec<StatusChanged>,
    /// Effects to carry out, in order.
    pub effects: Vec<Effect>,
}

impl Outcome {
    /// Whether nothing happened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.effects.is_empty()
    }

    fn extend(&mut self, other: Self) {
        self.changes.extend(other.changes);
        self.effects.extend(other.effects);
    }
}

/// Something that happened to a message outside the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// The remote store accepted the write.
    Acked {
        /// Document id the store assigned.
        remote_id: DocumentId,
    },
    /// A write attempt failed and another is scheduled.
    AttemptFailed {
        /// Failed attempts so far.
        attempts: u32,
    },
    /// The last allowed attempt failed.
    Exhausted {
        /// Failed attempts in total.
        attempts: u32,
    },
    /// The store permanently refused the content.
    Rejected {
        /// Store-provided reason.
        reason: String,
    },
    /// The message overstayed the stale timeout.
    StaleTimeout,
    /// The user has seen the message on screen.
    Seen,
}

/// Errors returned by [`StateMachine::retry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// No such message.
    #[error("message {0} is not tracked")]
    NotFound(MessageId),

    /// Only failed outbound messages can be retried.
    #[error("message {id} is {status}; only failed messages can be retried")]
    NotFailed {
        /// The message.
        id: MessageId,
        /// Its current status.
        status: DeliveryStatus,
    },
}

/// Errors returned when an event cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// No such message.
    #[error("message {0} is not tracked")]
    UnknownMessage(MessageId),

    /// The status table does not allow this step.
    #[error("message {id}: {from} -> {to} is not a permitted transition")]
    NotPermitted {
        /// The message.
        id: MessageId,
        /// Current status.
        from: DeliveryStatus,
        /// Requested status.
        to: DeliveryStatus,
    },

    /// A change event did not describe a message.
    #[error("unreadable message document: {0}")]
    Schema(#[from] SchemaError),
}

/// Authoritative per-message delivery status.
#[derive(Debug)]
pub struct StateMachine {
    local_sender: SenderId,
    messages: HashMap<MessageId, TrackedMessage>,
    /// Newest message per conversation, by `(created_at, id)`.
    latest: HashMap<ConversationId, (Timestamp, MessageId)>,
}

impl StateMachine {
    /// Creates an empty machine for the account `local_sender`.
    #[must_use]
    pub fn new(local_sender: SenderId) -> Self {
        Self {
            local_sender,
            messages: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    /// Account this device sends as.
    #[must_use]
    pub const fn local_sender(&self) -> &SenderId {
        &self.local_sender
    }

    /// Looks up a message.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&TrackedMessage> {
        self.messages.get(id)
    }

    /// Current status of a message.
    #[must_use]
    pub fn status(&self, id: &MessageId) -> Option<DeliveryStatus> {
        self.messages.get(id).map(|t| t.message.status)
    }

    /// Number of tracked messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no messages are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages of one conversation, oldest first.
    #[must_use]
    pub fn conversation(&self, conversation_id: &ConversationId) -> Vec<&TrackedMessage> {
        let mut list: Vec<_> = self
            .messages
            .values()
            .filter(|t| t.message.conversation_id == *conversation_id)
            .collect();
        list.sort_by_key(|t| (t.message.created_at, t.message.id));
        list
    }

    /// Whether `id` is the newest message of its conversation.
    #[must_use]
    pub fn is_latest(&self, id: &MessageId) -> bool {
        self.messages.get(id).is_some_and(|t| {
            self.latest
                .get(&t.message.conversation_id)
                .is_some_and(|(_, latest)| latest == id)
        })
    }

    /// Creates an outbound message in `sending` and asks for it to be queued.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the body cannot be sent; nothing is
    /// tracked in that case.
    pub fn submit(
        &mut self,
        conversation_id: ConversationId,
        body: MessageBody,
        now: Timestamp,
    ) -> Result<(MessageId, Outcome), ValidationError> {
        body.validate()?;
        let message = Message::new(
            MessageId::new(),
            conversation_id,
            self.local_sender.clone(),
            body,
            now,
        );
        let id = message.id;
        let tracked = TrackedMessage {
            message: message.clone(),
            direction: Direction::Outbound,
            sending_since: Some(now),
            failure: None,
        };
        let change = first_seen(&tracked, now);
        self.insert(tracked);

        Ok((
            id,
            Outcome {
                changes: vec![change],
                effects: vec![Effect::Enqueue(PendingSend::new(message, now))],
            },
        ))
    }

    /// Re-registers a message restored from the persisted queue.
    ///
    /// The queue already holds the entry, so no effect is requested. The
    /// stale timer restarts at `now`.
    pub fn restore(&mut self, pending: &PendingSend, now: Timestamp) -> Outcome {
        if self.messages.contains_key(pending.id()) {
            return Outcome::default();
        }
        let mut message = pending.message.clone();
        message.status = DeliveryStatus::Sending;
        message.retry_count = pending.attempts;
        let tracked = TrackedMessage {
            message,
            direction: Direction::Outbound,
            sending_since: Some(now),
            failure: None,
        };
        let change = first_seen(&tracked, now);
        self.insert(tracked);
        Outcome {
            changes: vec![change],
            effects: Vec::new(),
        }
    }

    /// Applies an event to one message.
    ///
    /// Events that do not fit the message's current status (a second ack,
    /// `Seen` on an outbound message) are ignored and yield an empty outcome.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::UnknownMessage`] for an untracked id.
    pub fn apply(
        &mut self,
        id: MessageId,
        event: DeliveryEvent,
        now: Timestamp,
    ) -> Result<Outcome, TransitionError> {
        let priority = self.priority(&id);
        let tracked = self
            .messages
            .get_mut(&id)
            .ok_or(TransitionError::UnknownMessage(id))?;
        let status = tracked.message.status;
        let mut outcome = Outcome::default();

        match event {
            DeliveryEvent::Acked { remote_id } => {
                if status == DeliveryStatus::Sending {
                    outcome.changes.push(acknowledge(tracked, remote_id, now)?);
                } else if tracked.message.remote_id.is_none() {
                    // Late ack after a forced failure: remember the document
                    // so a retry updates it instead of creating a duplicate.
                    tracing::debug!(message_id = %id, %status, "late ack recorded");
                    tracked.message.remote_id = Some(remote_id);
                }
            }
            DeliveryEvent::AttemptFailed { attempts } => {
                if status == DeliveryStatus::Sending {
                    tracked.message.retry_count = attempts;
                }
            }
            DeliveryEvent::Exhausted { attempts } => {
                if status == DeliveryStatus::Sending {
                    tracked.message.retry_count = attempts;
                    outcome
                        .changes
                        .push(fail(tracked, FailureReason::RetriesExhausted, now)?);
                }
            }
            DeliveryEvent::Rejected { reason } => {
                if status == DeliveryStatus::Sending {
                    outcome
                        .changes
                        .push(fail(tracked, FailureReason::Rejected(reason), now)?);
                }
            }
            DeliveryEvent::StaleTimeout => {
                if matches!(status, DeliveryStatus::Sending | DeliveryStatus::Sent) {
                    outcome
                        .changes
                        .push(fail(tracked, FailureReason::StaleTimeout, now)?);
                    if status == DeliveryStatus::Sending {
                        outcome.effects.push(Effect::Dequeue(id));
                    }
                }
            }
            DeliveryEvent::Seen => {
                let readable = matches!(status, DeliveryStatus::Sent | DeliveryStatus::Delivered);
                if tracked.direction == Direction::Inbound && readable {
                    let change = advance(tracked, DeliveryStatus::Read, None, now)?;
                    if let Some(update) = status_update(tracked, priority, now) {
                        outcome.effects.push(Effect::Propagate(update));
                    }
                    outcome.changes.push(change);
                }
            }
        }
        Ok(outcome)
    }

    /// Moves a failed outbound message back to `sending` with a fresh
    /// retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] if the message is unknown or not a failed
    /// outbound message.
    pub fn retry(&mut self, id: MessageId, now: Timestamp) -> Result<Outcome, RetryError> {
        let tracked = self.messages.get_mut(&id).ok_or(RetryError::NotFound(id))?;
        let status = tracked.message.status;
        if status != DeliveryStatus::Failed || tracked.direction != Direction::Outbound {
            return Err(RetryError::NotFailed { id, status });
        }

        tracked.message.retry_count = 0;
        tracked.failure = None;
        tracked.sending_since = Some(now);
        let change = advance(tracked, DeliveryStatus::Sending, None, now)
            .map_err(|_| RetryError::NotFailed { id, status })?;

        Ok(Outcome {
            changes: vec![change],
            effects: vec![Effect::Enqueue(PendingSend::new(
                tracked.message.clone(),
                now,
            ))],
        })
    }

    /// Ids of outbound messages that have been `sending` for at least
    /// `timeout`.
    #[must_use]
    pub fn stale(&self, now: Timestamp, timeout: Duration) -> Vec<MessageId> {
        let mut ids: Vec<_> = self
            .messages
            .values()
            .filter(|t| {
                t.message.status == DeliveryStatus::Sending
                    && t.sending_since
                        .is_some_and(|since| now.saturating_since(since) >= timeout)
            })
            .map(|t| t.message.id)
            .collect();
        ids.sort();
        ids
    }

    /// Forces every stale message to `failed`.
    pub fn expire_stale(&mut self, now: Timestamp, timeout: Duration) -> Outcome {
        let mut outcome = Outcome::default();
        for id in self.stale(now, timeout) {
            match self.apply(id, DeliveryEvent::StaleTimeout, now) {
                Ok(o) => outcome.extend(o),
                Err(e) => tracing::debug!(message_id = %id, error = %e, "stale expiry skipped"),
            }
        }
        outcome
    }

    /// Applies what the change feed reports about a message document.
    ///
    /// Idempotent: replays and duplicates of an event change nothing. A
    /// status is only adopted when it is ahead of the local one, one
    /// permitted step at a time.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Schema`] if the document is not a message.
    pub fn observe_remote(
        &mut self,
        event: &ChangeEvent,
        now: Timestamp,
    ) -> Result<Outcome, TransitionError> {
        if event.kind == ChangeKind::Removed {
            return Ok(Outcome::default());
        }
        let remote = schema::parse_message(&event.fields)?;
        let id = remote.local_id;

        let Some(tracked) = self.messages.get_mut(&id) else {
            return Ok(self.adopt(event.doc_id.clone(), &remote, now));
        };

        let mut outcome = Outcome::default();
        match tracked.message.status {
            DeliveryStatus::Failed => {
                if tracked.message.remote_id.is_none() {
                    tracing::debug!(message_id = %id, "failed message seen in store");
                    tracked.message.remote_id = Some(event.doc_id.clone());
                }
                return Ok(outcome);
            }
            DeliveryStatus::Sending => {
                // The document exists, so the write landed even if the queue
                // has not heard back yet.
                outcome
                    .changes
                    .push(acknowledge(tracked, event.doc_id.clone(), now)?);
                outcome.effects.push(Effect::Dequeue(id));
            }
            _ => {}
        }
        catch_up(tracked, &remote, now, &mut outcome)?;
        Ok(outcome)
    }

    /// Starts tracking a message first seen in the change feed.
    fn adopt(&mut self, doc_id: DocumentId, remote: &RemoteMessage, now: Timestamp) -> Outcome {
        if matches!(
            remote.status,
            DeliveryStatus::Sending | DeliveryStatus::Failed
        ) {
            return Outcome::default();
        }
        let direction = if remote.sender_id == self.local_sender {
            Direction::Outbound
        } else {
            Direction::Inbound
        };

        let mut message = Message::new(
            remote.local_id,
            remote.conversation_id,
            remote.sender_id.clone(),
            remote.body.clone(),
            remote.created_at,
        );
        message.remote_id = Some(doc_id);
        message.status = remote.status;
        message.delivered_at = remote.delivered_at.or(remote.read_at);
        message.read_at = remote.read_at;

        // Arrival on the counterpart's device is what `delivered` means.
        let newly_delivered =
            direction == Direction::Inbound && remote.status == DeliveryStatus::Sent;
        if newly_delivered {
            message.status = DeliveryStatus::Delivered;
            message.delivered_at = Some(now.max(message.created_at));
        }

        let tracked = TrackedMessage {
            message,
            direction,
            sending_since: None,
            failure: None,
        };
        let change = first_seen(&tracked, now);
        let id = tracked.message.id;
        self.insert(tracked);

        let mut outcome = Outcome {
            changes: vec![change],
            effects: Vec::new(),
        };
        if newly_delivered {
            let priority = self.priority(&id);
            if let Some(update) = self
                .messages
                .get(&id)
                .and_then(|t| status_update(t, priority, now))
            {
                outcome.effects.push(Effect::Propagate(update));
            }
        }
        outcome
    }

    fn insert(&mut self, tracked: TrackedMessage) {
        let key = (tracked.message.created_at, tracked.message.id);
        let latest = self
            .latest
            .entry(tracked.message.conversation_id)
            .or_insert(key);
        if key > *latest {
            *latest = key;
        }
        self.messages.insert(tracked.message.id, tracked);
    }

    fn priority(&self, id: &MessageId) -> Priority {
        if self.is_latest(id) {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

fn first_seen(tracked: &TrackedMessage, now: Timestamp) -> StatusChanged {
    StatusChanged {
        message_id: tracked.message.id,
        conversation_id: tracked.message.conversation_id,
        direction: tracked.direction,
        from: None,
        to: tracked.message.status,
        at: now,
        retry_count: tracked.message.retry_count,
    }
}

/// Moves one permitted step, stamping the matching timestamp.
///
/// `hint` is a timestamp reported by the remote; it is clamped so the
/// `created <= sent <= delivered <= read` chain holds.
fn advance(
    tracked: &mut TrackedMessage,
    to: DeliveryStatus,
    hint: Option<Timestamp>,
    now: Timestamp,
) -> Result<StatusChanged, TransitionError> {
    let from = tracked.message.status;
    if !from.can_transition_to(to) {
        return Err(TransitionError::NotPermitted {
            id: tracked.message.id,
            from,
            to,
        });
    }

    let msg = &mut tracked.message;
    let at = hint.unwrap_or(now).max(msg.latest_timestamp());
    match to {
        DeliveryStatus::Sent => {
            msg.sent_at.get_or_insert(at);
        }
        DeliveryStatus::Delivered => {
            msg.delivered_at.get_or_insert(at);
        }
        DeliveryStatus::Read => {
            msg.delivered_at.get_or_insert(at);
            msg.read_at.get_or_insert(at);
        }
        DeliveryStatus::Sending | DeliveryStatus::Failed => {}
    }
    msg.status = to;

    Ok(StatusChanged {
        message_id: msg.id,
        conversation_id: msg.conversation_id,
        direction: tracked.direction,
        from: Some(from),
        to,
        at,
        retry_count: msg.retry_count,
    })
}

fn acknowledge(
    tracked: &mut TrackedMessage,
    remote_id: DocumentId,
    now: Timestamp,
) -> Result<StatusChanged, TransitionError> {
    tracked.message.remote_id = Some(remote_id);
    tracked.message.retry_count = 0;
    tracked.sending_since = None;
    advance(tracked, DeliveryStatus::Sent, None, now)
}

fn fail(
    tracked: &mut TrackedMessage,
    reason: FailureReason,
    now: Timestamp,
) -> Result<StatusChanged, TransitionError> {
    let change = advance(tracked, DeliveryStatus::Failed, None, now)?;
    tracked.sending_since = None;
    tracked.failure = Some(reason);
    Ok(change)
}

/// Adopts a remote status that is ahead of the local one.
fn catch_up(
    tracked: &mut TrackedMessage,
    remote: &RemoteMessage,
    now: Timestamp,
    outcome: &mut Outcome,
) -> Result<(), TransitionError> {
    let local = tracked.message.status;
    if !remote.status.is_ahead_of(local) {
        return Ok(());
    }
    match remote.status {
        DeliveryStatus::Delivered if local == DeliveryStatus::Sent => {
            outcome.changes.push(advance(
                tracked,
                DeliveryStatus::Delivered,
                remote.delivered_at,
                now,
            )?);
        }
        DeliveryStatus::Read => {
            if tracked.message.delivered_at.is_none()
                && let Some(delivered_at) = remote.delivered_at
            {
                let floor = tracked.message.latest_timestamp();
                tracked.message.delivered_at = Some(delivered_at.max(floor));
            }
            outcome
                .changes
                .push(advance(tracked, DeliveryStatus::Read, remote.read_at, now)?);
        }
        _ => {}
    }
    Ok(())
}

/// Builds the remote write for an inbound message's current status.
fn status_update(
    tracked: &TrackedMessage,
    priority: Priority,
    now: Timestamp,
) -> Option<StatusUpdate> {
    let Some(remote_id) = tracked.message.remote_id.clone() else {
        tracing::warn!(message_id = %tracked.message.id, "inbound message without document id");
        return None;
    };
    let message = &tracked.message;
    let changed_at = match message.status {
        DeliveryStatus::Delivered => message.delivered_at,
        DeliveryStatus::Read => message.read_at,
        _ => None,
    };
    Some(StatusUpdate {
        message_id: message.id,
        remote_id,
        target: message.status,
        priority,
        enqueued_at: now,
        changed_at: changed_at.unwrap_or(now),
    })
}
