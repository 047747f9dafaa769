//! Batched status propagator.
//!
//! Receipts (`delivered`, `read`) for inbound messages are buffered in an
//! [`UpdateQueue`] and written to the remote store in small concurrent
//! batches on a fixed period. Updates for the same message merge before
//! they are written, and a status is never written twice or backwards.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use courier_proto::delivery::StatusUpdate;
use courier_proto::message::{DeliveryStatus, MessageId};
use courier_proto::schema;

use crate::config::DeliveryConfig;
use crate::remote::{RemoteError, RemoteStore};

// ---------------------------------------------------------------------------
// Update queue
// ---------------------------------------------------------------------------

/// Pending status writes, keyed by message.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: HashMap<MessageId, StatusUpdate>,
    /// Highest status already written per message. A written `read` is
    /// forgotten, nothing follows it.
    written: HashMap<MessageId, DeliveryStatus>,
    in_flight: HashSet<MessageId>,
}

impl UpdateQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an update, merging with any pending one for the same message.
    ///
    /// Returns `false` if the update was dropped because an equal or more
    /// advanced status has already been written.
    pub fn push(&mut self, update: StatusUpdate) -> bool {
        if self
            .written
            .get(&update.message_id)
            .is_some_and(|w| !update.target.is_ahead_of(*w))
        {
            return false;
        }
        match self.pending.get_mut(&update.message_id) {
            Some(existing) => merge(existing, update),
            None => {
                self.pending.insert(update.message_id, update);
            }
        }
        true
    }

    /// Takes up to `max` updates, high priority first, then oldest first.
    /// Messages with a write in flight are skipped.
    pub fn pop_batch(&mut self, max: usize) -> Vec<StatusUpdate> {
        let mut ready: Vec<_> = self
            .pending
            .values()
            .filter(|u| !self.in_flight.contains(&u.message_id))
            .map(|u| (Reverse(u.priority), u.enqueued_at, u.message_id))
            .collect();
        ready.sort_unstable();

        ready
            .into_iter()
            .take(max)
            .filter_map(|(_, _, id)| {
                let update = self.pending.remove(&id)?;
                self.in_flight.insert(id);
                Some(update)
            })
            .collect()
    }

    /// Records the result of writing `update`.
    ///
    /// Transient failures put the update back; a missing document or a
    /// rejection drops it.
    pub fn complete(&mut self, update: StatusUpdate, result: &Result<(), RemoteError>) {
        let id = update.message_id;
        self.in_flight.remove(&id);
        match result {
            Ok(()) => {
                if update.target.is_terminal() {
                    self.written.remove(&id);
                } else {
                    let written = self.written.entry(id).or_insert(update.target);
                    if update.target.is_ahead_of(*written) {
                        *written = update.target;
                    }
                }
                let stale = self
                    .pending
                    .get(&id)
                    .is_some_and(|p| !p.target.is_ahead_of(update.target));
                if stale {
                    self.pending.remove(&id);
                }
            }
            Err(RemoteError::NotFound(_) | RemoteError::Rejected(_)) => {
                tracing::warn!(message_id = %id, target = %update.target, error = ?result, "status update dropped");
            }
            Err(e) => {
                tracing::debug!(message_id = %id, error = %e, "status update requeued");
                self.push(update);
            }
        }
    }

    /// Updates waiting to be written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Messages whose last written status is remembered.
    #[must_use]
    pub fn written_len(&self) -> usize {
        self.written.len()
    }

    /// Pending update for a message.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&StatusUpdate> {
        self.pending.get(id)
    }
}

/// Folds `newer` into `existing`: furthest target with its transition
/// time, earliest enqueue time, highest priority.
fn merge(existing: &mut StatusUpdate, newer: StatusUpdate) {
    if newer.target.is_ahead_of(existing.target) {
        existing.target = newer.target;
        existing.changed_at = newer.changed_at;
    }
    existing.enqueued_at = existing.enqueued_at.min(newer.enqueued_at);
    existing.priority = existing.priority.max(newer.priority);
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Requests accepted by the propagator.
#[derive(Debug)]
pub enum PropagatorCommand {
    /// Queue a status write.
    Push(StatusUpdate),
    /// Drain what can be written, then stop.
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the propagator.
#[derive(Debug, Clone)]
pub struct PropagatorHandle {
    tx: mpsc::UnboundedSender<PropagatorCommand>,
    depth: watch::Receiver<usize>,
}

impl PropagatorHandle {
    /// Creates a handle and the receiving ends the worker needs.
    #[must_use]
    pub fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<PropagatorCommand>,
        watch::Sender<usize>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (depth_tx, depth) = watch::channel(0);
        (Self { tx, depth }, rx, depth_tx)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<PropagatorCommand>) {
        let (handle, rx, _) = Self::channel();
        (handle, rx)
    }

    /// Queues a status write.
    pub fn push(&self, update: StatusUpdate) {
        let id = update.message_id;
        if self.tx.send(PropagatorCommand::Push(update)).is_err() {
            tracing::warn!(message_id = %id, "propagator stopped, status update lost");
        }
    }

    /// Updates currently waiting.
    #[must_use]
    pub fn depth(&self) -> usize {
        *self.depth.borrow()
    }

    /// Watches the queue depth.
    #[must_use]
    pub fn watch_depth(&self) -> watch::Receiver<usize> {
        self.depth.clone()
    }

    /// Drains and stops the worker. Returns once it has stopped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PropagatorCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The propagator worker.
pub struct Propagator<R> {
    queue: UpdateQueue,
    remote: Arc<R>,
    collection: String,
    batch_size: usize,
    flush_interval: Duration,
    backlog_threshold: usize,
    depth: watch::Sender<usize>,
}

impl<R: RemoteStore> Propagator<R> {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        remote: Arc<R>,
        config: &DeliveryConfig,
        depth: watch::Sender<usize>,
    ) -> Self {
        Self {
            queue: UpdateQueue::new(),
            remote,
            collection: config.collection.clone(),
            batch_size: config.flush_batch_size.max(1),
            flush_interval: config.flush_interval,
            backlog_threshold: config.backlog_threshold,
            depth,
        }
    }

    /// Runs until shut down or every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PropagatorCommand>) {
        let mut next_flush = Instant::now() + self.period();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PropagatorCommand::Push(update)) => {
                        let id = update.message_id;
                        if !self.queue.push(update) {
                            tracing::debug!(message_id = %id, "status already written, update skipped");
                        }
                        self.publish();
                    }
                    Some(PropagatorCommand::Shutdown(done)) => {
                        self.drain().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
                () = tokio::time::sleep_until(next_flush) => {
                    self.flush().await;
                    next_flush = Instant::now() + self.period();
                }
            }
        }
        tracing::debug!("propagator stopped");
    }

    /// Flush period; halved while the backlog is deep.
    fn period(&self) -> Duration {
        if self.queue.len() > self.backlog_threshold {
            self.flush_interval / 2
        } else {
            self.flush_interval
        }
    }

    /// Writes one batch. Returns how many writes succeeded.
    async fn flush(&mut self) -> usize {
        let batch = self.queue.pop_batch(self.batch_size);
        if batch.is_empty() {
            return 0;
        }
        let writes = batch.iter().map(|u| {
            self.remote.update(
                &self.collection,
                &u.remote_id,
                schema::status_fields(u.target, u.changed_at),
            )
        });
        let results = join_all(writes).await;

        let mut written = 0;
        for (update, result) in batch.into_iter().zip(results) {
            if result.is_ok() {
                written += 1;
            }
            self.queue.complete(update, &result);
        }
        tracing::debug!(written, remaining = self.queue.len(), "status batch flushed");
        self.publish();
        written
    }

    /// Flushes until the queue is empty or a batch makes no progress.
    async fn drain(&mut self) {
        while !self.queue.is_empty() {
            if self.flush().await == 0 {
                tracing::warn!(unsent = self.queue.len(), "propagator stopping with unsent status updates");
                break;
            }
        }
    }

    fn publish(&self) {
        self.depth.send_replace(self.queue.len());
    }
}
