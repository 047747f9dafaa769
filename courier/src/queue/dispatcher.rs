//! Queue worker: owns the [`Outbox`] and writes due entries to the remote
//! store.
//!
//! The loop wakes on commands, finished attempts, connectivity returning,
//! lifecycle changes and the earliest retry deadline. At most
//! `max_in_flight` writes run at once; the rest wait in the outbox without
//! polling.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use courier_proto::delivery::PendingSend;
use courier_proto::document::DocumentId;
use courier_proto::message::MessageId;
use courier_proto::schema;

use super::{BackoffPolicy, Outbox, QueueError};
use crate::clock::{self, Clock};
use crate::config::DeliveryConfig;
use crate::connectivity::{BecameOnline, ConnectionQuality};
use crate::delivery::Report;
use crate::error::DeliveryError;
use crate::lifecycle::AppState;
use crate::remote::{RemoteError, RemoteStore};

/// Requests accepted by the queue worker.
#[derive(Debug)]
pub enum QueueCommand {
    /// Add a new entry.
    Enqueue(PendingSend),
    /// Drop an entry, even if a write for it is in flight.
    Cancel(MessageId),
    /// Reply with a copy of every entry.
    Snapshot(oneshot::Sender<Vec<PendingSend>>),
    /// Persist now and reply with the result.
    Flush(oneshot::Sender<Result<(), QueueError>>),
    /// Persist and stop.
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the queue worker.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
    pending: watch::Receiver<Vec<MessageId>>,
}

impl QueueHandle {
    /// Creates a handle and the receiving ends the worker needs.
    #[must_use]
    pub fn channel(
        initial: Vec<MessageId>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<QueueCommand>,
        watch::Sender<Vec<MessageId>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending_tx, pending) = watch::channel(initial);
        (Self { tx, pending }, rx, pending_tx)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<QueueCommand>) {
        let (handle, rx, _) = Self::channel(Vec::new());
        (handle, rx)
    }

    /// Queues a new entry.
    pub fn enqueue(&self, entry: PendingSend) {
        let id = *entry.id();
        if self.tx.send(QueueCommand::Enqueue(entry)).is_err() {
            tracing::warn!(message_id = %id, "queue stopped, entry not queued");
        }
    }

    /// Cancels an entry.
    pub fn cancel(&self, id: MessageId) {
        if self.tx.send(QueueCommand::Cancel(id)).is_err() {
            tracing::debug!(message_id = %id, "queue stopped, cancel dropped");
        }
    }

    /// Copy of every queued entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the worker has stopped.
    pub async fn snapshot(&self) -> Result<Vec<PendingSend>, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Snapshot(tx))
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Persists the outbox now.
    ///
    /// # Errors
    ///
    /// Returns the persistence error, or [`QueueError::Closed`] if the
    /// worker has stopped.
    pub async fn flush(&self) -> Result<(), QueueError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Flush(tx))
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)?
    }

    /// Persists and stops the worker. Returns once it has stopped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(QueueCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Ids currently queued.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.pending.borrow().clone()
    }

    /// Watches the queued ids.
    #[must_use]
    pub fn watch_pending(&self) -> watch::Receiver<Vec<MessageId>> {
        self.pending.clone()
    }
}

/// Everything that can wake the worker besides its own attempts.
#[derive(Debug)]
pub struct Triggers {
    /// Commands from [`QueueHandle`]s.
    pub commands: mpsc::UnboundedReceiver<QueueCommand>,
    /// Current connectivity.
    pub connectivity: watch::Receiver<ConnectionQuality>,
    /// Offline to online edges.
    pub online: broadcast::Receiver<BecameOnline>,
    /// Foreground/background state.
    pub lifecycle: watch::Receiver<AppState>,
}

/// Result of one write.
struct Attempt {
    id: MessageId,
    result: Result<DocumentId, RemoteError>,
}

/// The queue worker.
pub struct Dispatcher<R> {
    outbox: Outbox,
    remote: Arc<R>,
    collection: String,
    policy: BackoffPolicy,
    max_in_flight: usize,
    clock: Arc<dyn Clock>,
    reports: mpsc::UnboundedSender<Report>,
    pending: watch::Sender<Vec<MessageId>>,
    in_flight: HashSet<MessageId>,
}

impl<R: RemoteStore> Dispatcher<R> {
    /// Creates a worker over a restored outbox.
    #[must_use]
    pub fn new(
        outbox: Outbox,
        remote: Arc<R>,
        config: &DeliveryConfig,
        clock: Arc<dyn Clock>,
        reports: mpsc::UnboundedSender<Report>,
        pending: watch::Sender<Vec<MessageId>>,
    ) -> Self {
        Self {
            outbox,
            remote,
            collection: config.collection.clone(),
            policy: config.backoff(),
            max_in_flight: config.max_in_flight.max(1),
            clock,
            reports,
            pending,
            in_flight: HashSet::new(),
        }
    }

    /// Runs until shut down or every handle is dropped.
    pub async fn run(mut self, triggers: Triggers) {
        let Triggers {
            mut commands,
            connectivity,
            mut online,
            mut lifecycle,
        } = triggers;
        let mut attempts: FuturesUnordered<BoxFuture<'static, Attempt>> = FuturesUnordered::new();
        let mut online_open = true;
        let mut lifecycle_open = true;
        self.publish();

        loop {
            let is_online = connectivity.borrow().is_online();
            let foreground = *lifecycle.borrow() == AppState::Foreground;
            if is_online {
                self.dispatch_due(&mut attempts);
            }

            // Retry timers only run while they could act on the result.
            let deadline = if is_online && foreground && self.in_flight.len() < self.max_in_flight
            {
                self.outbox
                    .next_due(&self.in_flight)
                    .map(|at| clock::deadline_for(self.clock.as_ref(), at))
            } else {
                None
            };
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(QueueCommand::Shutdown(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(attempt) = attempts.next(), if !attempts.is_empty() => {
                    self.finish(attempt);
                }
                result = online.recv(), if online_open => match result {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        tracing::info!(pending = self.outbox.len(), "back online, retrying everything");
                        self.outbox.make_all_due(self.clock.now());
                    }
                    Err(broadcast::error::RecvError::Closed) => online_open = false,
                },
                result = lifecycle.changed(), if lifecycle_open => {
                    if result.is_err() {
                        lifecycle_open = false;
                    }
                }
                () = timer => {}
            }
        }
        tracing::debug!("queue worker stopped");
    }

    fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue(entry) => {
                let id = *entry.id();
                match self.outbox.insert(entry) {
                    Ok(()) => tracing::debug!(message_id = %id, "queued"),
                    Err(e) => tracing::warn!(message_id = %id, error = %e, "enqueue ignored"),
                }
                self.publish();
            }
            QueueCommand::Cancel(id) => {
                if self.outbox.remove(&id).is_some() {
                    tracing::debug!(message_id = %id, in_flight = self.in_flight.contains(&id), "entry cancelled");
                    self.publish();
                }
            }
            QueueCommand::Snapshot(reply) => {
                let _ = reply.send(self.outbox.entries().cloned().collect());
            }
            QueueCommand::Flush(reply) => {
                let _ = reply.send(self.outbox.persist());
            }
            QueueCommand::Shutdown(_) => {}
        }
    }

    fn dispatch_due(&mut self, attempts: &mut FuturesUnordered<BoxFuture<'static, Attempt>>) {
        for id in self.outbox.due(self.clock.now()) {
            if self.in_flight.len() >= self.max_in_flight {
                break;
            }
            if self.in_flight.contains(&id) {
                continue;
            }
            let Some(entry) = self.outbox.get(&id) else {
                continue;
            };
            let attempt = self.start_attempt(entry);
            tracing::debug!(message_id = %id, attempt = entry.attempts + 1, "writing message");
            self.in_flight.insert(id);
            attempts.push(attempt);
        }
    }

    fn start_attempt(&self, entry: &PendingSend) -> BoxFuture<'static, Attempt> {
        let remote = Arc::clone(&self.remote);
        let collection = self.collection.clone();
        let id = *entry.id();
        let existing = entry.message.remote_id.clone();
        let mut fields = schema::message_fields(&entry.message);

        async move {
            let result = match existing {
                // Already written once: re-confirm the document without
                // touching the status the counterpart may have advanced.
                Some(doc_id) => {
                    fields.remove(schema::STATUS);
                    remote
                        .update(&collection, &doc_id, fields)
                        .await
                        .map(|()| doc_id)
                }
                None => remote.create(&collection, fields).await,
            };
            Attempt { id, result }
        }
        .boxed()
    }

    fn finish(&mut self, attempt: Attempt) {
        let Attempt { id, result } = attempt;
        self.in_flight.remove(&id);

        let Some(mut entry) = self.outbox.get(&id).cloned() else {
            // Cancelled while in flight; a success still tells the tracker
            // where the document lives.
            if let Ok(remote_id) = result {
                self.report(Report::Acked { id, remote_id });
            }
            return;
        };

        match result {
            Ok(remote_id) => {
                self.outbox.remove(&id);
                tracing::debug!(message_id = %id, doc_id = %remote_id, "message written");
                self.report(Report::Acked { id, remote_id });
            }
            Err(err) => {
                let error = DeliveryError::from(err);
                if error.is_retryable() {
                    let failures = entry.attempts;
                    entry.attempts = entry.attempts.saturating_add(1);
                    let attempts = entry.attempts;
                    if self.policy.is_exhausted(attempts) {
                        self.outbox.remove(&id);
                        self.report(Report::Exhausted {
                            id,
                            attempts,
                            error,
                        });
                    } else {
                        let delay = self.policy.delay_after(failures, &error);
                        entry.next_retry_at = self.clock.now().saturating_add(delay);
                        entry.message.retry_count = attempts;
                        tracing::debug!(message_id = %id, attempts, delay_ms = delay.as_millis(), "retry scheduled");
                        self.outbox.replace(entry);
                        self.report(Report::AttemptFailed {
                            id,
                            attempts,
                            error,
                        });
                    }
                } else {
                    self.outbox.remove(&id);
                    self.report(Report::Rejected {
                        id,
                        reason: error.to_string(),
                    });
                }
            }
        }
        self.publish();
    }

    fn report(&self, report: Report) {
        if self.reports.send(report).is_err() {
            tracing::debug!("tracker gone, report dropped");
        }
    }

    fn publish(&self) {
        self.pending.send_replace(self.outbox.ids());
    }

    fn shutdown(&self) {
        if let Err(e) = self.outbox.persist() {
            tracing::error!(error = %e, "failed to persist outbox on shutdown");
        }
        tracing::info!(pending = self.outbox.len(), in_flight = self.in_flight.len(), "queue stopped");
    }
}
