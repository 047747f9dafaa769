//! Shared, observable wrapper around the [`StateMachine`].
//!
//! [`DeliveryTracker`] serializes every state change behind one lock and
//! carries out the resulting effects while still holding it, so the queue
//! and propagator see effects in the same order the machine produced them.
//! Workers talk back to the tracker through [`Report`]s, which the driver
//! task ([`DeliveryTracker::run`]) applies one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use courier_proto::delivery::PendingSend;
use courier_proto::document::{ChangeEvent, DocumentId};
use courier_proto::message::{
    ConversationId, DeliveryStatus, MessageBody, MessageId, SenderId, ValidationError,
};

use super::{
    DeliveryEvent, Effect, Outcome, RetryError, StateMachine, StatusChanged, TrackedMessage,
};
use crate::clock::Clock;
use crate::error::DeliveryError;
use crate::propagator::PropagatorHandle;
use crate::queue::QueueHandle;

/// Capacity of the status change broadcast.
const EVENT_CAPACITY: usize = 256;

/// Something a worker observed that may change a message's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// The queue's write was accepted.
    Acked {
        /// Message written.
        id: MessageId,
        /// Document id the store assigned.
        remote_id: DocumentId,
    },
    /// A write failed and will be retried.
    AttemptFailed {
        /// Message written.
        id: MessageId,
        /// Failed attempts so far.
        attempts: u32,
        /// Why it failed.
        error: DeliveryError,
    },
    /// The last allowed write failed.
    Exhausted {
        /// Message written.
        id: MessageId,
        /// Failed attempts in total.
        attempts: u32,
        /// The final error.
        error: DeliveryError,
    },
    /// The store refused the content.
    Rejected {
        /// Message written.
        id: MessageId,
        /// Store-provided reason.
        reason: String,
    },
    /// The user saw the message.
    Seen(MessageId),
    /// The change feed reported a document.
    Change(ChangeEvent),
}

/// Watches the status of one message.
#[derive(Debug, Clone)]
pub struct StatusObserver {
    rx: watch::Receiver<DeliveryStatus>,
}

impl StatusObserver {
    /// Status as of now.
    #[must_use]
    pub fn current(&self) -> DeliveryStatus {
        *self.rx.borrow()
    }

    /// Waits for the next change and returns the new status, or `None` once
    /// the tracker is gone.
    pub async fn changed(&mut self) -> Option<DeliveryStatus> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Waits until the status satisfies `predicate`, returning it, or
    /// `None` once the tracker is gone.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(DeliveryStatus) -> bool,
    ) -> Option<DeliveryStatus> {
        self.rx.wait_for(|s| predicate(*s)).await.ok().map(|s| *s)
    }
}

/// A freshly submitted message and a way to follow it.
#[derive(Debug, Clone)]
pub struct MessageHandle {
    /// Local id of the message.
    pub id: MessageId,
    /// Status observer, starting at `sending`.
    pub status: StatusObserver,
}

/// Shared delivery state, its observers and its outbound effects.
pub struct DeliveryTracker {
    machine: Mutex<StateMachine>,
    /// Lazily created per-message watches, dropped once the message is
    /// terminal and nobody is watching. Locked after `machine`.
    watchers: Mutex<HashMap<MessageId, watch::Sender<DeliveryStatus>>>,
    events: broadcast::Sender<StatusChanged>,
    queue: QueueHandle,
    propagator: PropagatorHandle,
    clock: Arc<dyn Clock>,
    stale_timeout: Duration,
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("tracked", &self.machine.lock().len())
            .field("stale_timeout", &self.stale_timeout)
            .finish_non_exhaustive()
    }
}

impl DeliveryTracker {
    /// Creates a tracker whose effects go to `queue` and `propagator`.
    #[must_use]
    pub fn new(
        local_sender: SenderId,
        queue: QueueHandle,
        propagator: PropagatorHandle,
        clock: Arc<dyn Clock>,
        stale_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            machine: Mutex::new(StateMachine::new(local_sender)),
            watchers: Mutex::new(HashMap::new()),
            events,
            queue,
            propagator,
            clock,
            stale_timeout,
        }
    }

    /// Creates and queues a new outbound message.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the body cannot be sent.
    pub fn submit(
        &self,
        conversation_id: ConversationId,
        body: MessageBody,
    ) -> Result<MessageHandle, ValidationError> {
        let mut machine = self.machine.lock();
        let (id, outcome) = machine.submit(conversation_id, body, self.clock.now())?;
        let status = self.watch_locked(id, DeliveryStatus::Sending);
        self.commit(outcome);
        drop(machine);

        tracing::info!(message_id = %id, conversation_id = %conversation_id, "message submitted");
        Ok(MessageHandle { id, status })
    }

    /// Re-registers an entry restored from the persisted queue.
    pub fn restore(&self, pending: &PendingSend) {
        let mut machine = self.machine.lock();
        let outcome = machine.restore(pending, self.clock.now());
        self.commit(outcome);
    }

    /// Applies one worker report.
    pub fn handle(&self, report: Report) {
        let now = self.clock.now();
        let mut machine = self.machine.lock();
        let result = match report {
            Report::Acked { id, remote_id } => {
                machine.apply(id, DeliveryEvent::Acked { remote_id }, now)
            }
            Report::AttemptFailed {
                id,
                attempts,
                error,
            } => {
                tracing::warn!(message_id = %id, attempts, error = %error, "send attempt failed");
                machine.apply(id, DeliveryEvent::AttemptFailed { attempts }, now)
            }
            Report::Exhausted {
                id,
                attempts,
                error,
            } => {
                tracing::error!(message_id = %id, attempts, error = %error, "giving up on message");
                machine.apply(id, DeliveryEvent::Exhausted { attempts }, now)
            }
            Report::Rejected { id, reason } => {
                tracing::error!(message_id = %id, reason = %reason, "message rejected by store");
                machine.apply(id, DeliveryEvent::Rejected { reason }, now)
            }
            Report::Seen(id) => machine.apply(id, DeliveryEvent::Seen, now),
            Report::Change(event) => machine.observe_remote(&event, now),
        };

        match result {
            Ok(outcome) => self.commit(outcome),
            Err(e) => tracing::debug!(error = %e, "report ignored"),
        }
    }

    /// Manually retries a failed message.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] if the message is unknown or not failed.
    pub fn retry(&self, id: MessageId) -> Result<(), RetryError> {
        let mut machine = self.machine.lock();
        let outcome = machine.retry(id, self.clock.now())?;
        self.commit(outcome);
        tracing::info!(message_id = %id, "manual retry");
        Ok(())
    }

    /// Fails every message stuck in `sending` past the stale timeout and
    /// returns how many were failed.
    pub fn sweep_stale(&self) -> usize {
        let mut machine = self.machine.lock();
        let outcome = machine.expire_stale(self.clock.now(), self.stale_timeout);
        let expired = outcome.changes.len();
        self.commit(outcome);
        self.watchers
            .lock()
            .retain(|_, tx| tx.receiver_count() > 0 || !tx.borrow().is_terminal());
        drop(machine);
        if expired > 0 {
            tracing::warn!(expired, "stale messages forced to failed");
        }
        expired
    }

    /// Returns an observer for one message, or `None` if it is not tracked.
    #[must_use]
    pub fn observe(&self, id: MessageId) -> Option<StatusObserver> {
        let machine = self.machine.lock();
        self.observer_locked(&machine, id)
    }

    /// Subscribes to every status change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChanged> {
        self.events.subscribe()
    }

    /// Messages with a live status watch.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Snapshot of one message.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<TrackedMessage> {
        self.machine.lock().get(id).cloned()
    }

    /// Current status of one message.
    #[must_use]
    pub fn status(&self, id: &MessageId) -> Option<DeliveryStatus> {
        self.machine.lock().status(id)
    }

    /// Snapshot of one conversation, oldest first.
    #[must_use]
    pub fn conversation(&self, conversation_id: &ConversationId) -> Vec<TrackedMessage> {
        self.machine
            .lock()
            .conversation(conversation_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Applies reports until every sender is gone, sweeping for stale
    /// messages every `sweep_interval`.
    pub async fn run(
        self: Arc<Self>,
        mut reports: mpsc::UnboundedReceiver<Report>,
        sweep_interval: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately.
        sweep.tick().await;

        loop {
            tokio::select! {
                report = reports.recv() => match report {
                    Some(report) => self.handle(report),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep_stale();
                }
            }
        }
        tracing::debug!("tracker driver stopped");
    }

    fn observer_locked(&self, machine: &StateMachine, id: MessageId) -> Option<StatusObserver> {
        let status = machine.status(&id)?;
        Some(self.watch_locked(id, status))
    }

    fn watch_locked(&self, id: MessageId, status: DeliveryStatus) -> StatusObserver {
        let rx = self
            .watchers
            .lock()
            .entry(id)
            .or_insert_with(|| watch::Sender::new(status))
            .subscribe();
        StatusObserver { rx }
    }

    /// Publishes changes and carries out effects. Callers hold the machine
    /// lock.
    fn commit(&self, outcome: Outcome) {
        if outcome.is_empty() {
            return;
        }
        {
            let mut watchers = self.watchers.lock();
            for change in &outcome.changes {
                tracing::info!(
                    message_id = %change.message_id,
                    from = ?change.from,
                    to = %change.to,
                    "status changed"
                );
                if let Some(tx) = watchers.get(&change.message_id) {
                    tx.send_replace(change.to);
                    if change.to.is_terminal() && tx.receiver_count() == 0 {
                        watchers.remove(&change.message_id);
                    }
                }
            }
        }
        for change in outcome.changes {
            // No subscribers is fine.
            let _ = self.events.send(change);
        }

        for effect in outcome.effects {
            match effect {
                Effect::Enqueue(entry) => self.queue.enqueue(entry),
                Effect::Dequeue(id) => self.queue.cancel(id),
                Effect::Propagate(update) => self.propagator.push(update),
            }
        }
    }
}
