//! Engine wiring.
//!
//! [`DeliveryEngine`] builds every component, restores the offline queue,
//! starts the workers and exposes the public API the UI layer uses:
//! submit messages, observe their status, report visibility, and feed in
//! connectivity and lifecycle changes.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use courier_proto::delivery::PendingSend;
use courier_proto::document::Query;
use courier_proto::message::{
    ConversationId, MessageBody, MessageId, SenderId, ValidationError,
};
use courier_proto::schema;

use crate::clock::{Clock, TokioClock};
use crate::config::{ConfigError, DeliveryConfig};
use crate::connectivity::{ConnectionQuality, ConnectivityMonitor, LinkReport};
use crate::delivery::{
    DeliveryTracker, MessageHandle, Report, RetryError, StatusChanged, StatusObserver,
    TrackedMessage,
};
use crate::lifecycle::{AppState, LifecycleSignal};
use crate::propagator::{Propagator, PropagatorHandle};
use crate::queue::{Dispatcher, Outbox, QueueError, QueueHandle, Triggers};
use crate::receipts::{ReceiptDetector, VisibilitySample};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::LocalStorage;

/// Errors returned by the engine API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The message content cannot be sent.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// Retry was refused.
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// The remote store failed.
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// The offline queue failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The configuration is unusable.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Collects the collaborators of a [`DeliveryEngine`].
pub struct EngineBuilder<R> {
    remote: Arc<R>,
    storage: Arc<dyn LocalStorage>,
    sender: SenderId,
    config: DeliveryConfig,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<ConnectivityMonitor>,
    lifecycle: Option<LifecycleSignal>,
}

impl<R: RemoteStore> EngineBuilder<R> {
    /// Overrides the default configuration.
    #[must_use]
    pub fn with_config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the clock (default: [`TokioClock`]).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares an existing connectivity monitor.
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Shares an existing lifecycle signal.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecycleSignal) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Restores the offline queue and starts every worker. Must be called
    /// inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the configuration is unusable.
    pub fn start(self) -> Result<DeliveryEngine<R>, EngineError> {
        let Self {
            remote,
            storage,
            sender,
            config,
            clock,
            connectivity,
            lifecycle,
        } = self;
        config.validate()?;
        let clock = clock.unwrap_or_else(|| Arc::new(TokioClock::new()));
        let connectivity = connectivity.unwrap_or_default();
        let lifecycle = lifecycle.unwrap_or_default();

        // The queue comes back before anything else can touch it.
        let outbox = Outbox::restore(storage);
        let restored: Vec<PendingSend> = outbox.entries().cloned().collect();

        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (queue, commands, pending_tx) = QueueHandle::channel(outbox.ids());
        let (propagator, propagator_rx, depth_tx) = PropagatorHandle::channel();
        let tracker = Arc::new(DeliveryTracker::new(
            sender.clone(),
            queue.clone(),
            propagator.clone(),
            Arc::clone(&clock),
            config.stale_timeout,
        ));
        for entry in &restored {
            tracker.restore(entry);
        }

        let dispatcher = Dispatcher::new(
            outbox,
            Arc::clone(&remote),
            &config,
            Arc::clone(&clock),
            reports_tx.clone(),
            pending_tx,
        );
        let mut tasks = vec![tokio::spawn(dispatcher.run(Triggers {
            commands,
            connectivity: connectivity.watch(),
            online: connectivity.subscribe_online(),
            lifecycle: lifecycle.subscribe(),
        }))];

        let worker = Propagator::new(Arc::clone(&remote), &config, depth_tx);
        tasks.push(tokio::spawn(worker.run(propagator_rx)));

        tasks.push(tokio::spawn(
            Arc::clone(&tracker).run(reports_rx, config.stale_sweep_interval),
        ));

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let detector = ReceiptDetector::new(
            config.visibility_threshold,
            config.visibility_dwell,
            Arc::clone(&clock),
            reports_tx.clone(),
        );
        tasks.push(tokio::spawn(detector.run(samples_rx, lifecycle.subscribe())));

        tracing::info!(sender = %sender, restored = restored.len(), "delivery engine started");

        Ok(DeliveryEngine {
            remote,
            config,
            clock,
            tracker,
            queue,
            propagator,
            connectivity,
            lifecycle,
            reports: reports_tx,
            samples: samples_tx,
            watched: Mutex::new(HashSet::new()),
            tasks: Mutex::new(tasks),
        })
    }
}

/// The delivery-tracking engine for one account on one device.
pub struct DeliveryEngine<R> {
    remote: Arc<R>,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    tracker: Arc<DeliveryTracker>,
    queue: QueueHandle,
    propagator: PropagatorHandle,
    connectivity: ConnectivityMonitor,
    lifecycle: LifecycleSignal,
    reports: mpsc::UnboundedSender<Report>,
    samples: mpsc::UnboundedSender<VisibilitySample>,
    watched: Mutex<HashSet<ConversationId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<R> std::fmt::Debug for DeliveryEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("tracker", &self.tracker)
            .field("connectivity", &self.connectivity.current())
            .field("lifecycle", &self.lifecycle.current())
            .finish_non_exhaustive()
    }
}

impl<R: RemoteStore> DeliveryEngine<R> {
    /// Starts building an engine that writes to `remote`, persists its
    /// queue in `storage` and sends as `sender`.
    pub fn builder(
        remote: Arc<R>,
        storage: Arc<dyn LocalStorage>,
        sender: SenderId,
    ) -> EngineBuilder<R> {
        EngineBuilder {
            remote,
            storage,
            sender,
            config: DeliveryConfig::default(),
            clock: None,
            connectivity: None,
            lifecycle: None,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    // -- Messages --

    /// Creates a message in `sending` and queues it for writing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for content that cannot be sent.
    pub fn submit(
        &self,
        conversation_id: ConversationId,
        body: MessageBody,
    ) -> Result<MessageHandle, EngineError> {
        Ok(self.tracker.submit(conversation_id, body)?)
    }

    /// Observes one message's status.
    #[must_use]
    pub fn observe_status(&self, id: MessageId) -> Option<StatusObserver> {
        self.tracker.observe(id)
    }

    /// Subscribes to every status change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChanged> {
        self.tracker.subscribe()
    }

    /// Retries a failed message with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] if the message is unknown or not failed.
    pub fn retry(&self, id: MessageId) -> Result<(), RetryError> {
        self.tracker.retry(id)
    }

    /// Snapshot of one message.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<TrackedMessage> {
        self.tracker.message(id)
    }

    /// Snapshot of one conversation, oldest first.
    #[must_use]
    pub fn conversation(&self, conversation_id: &ConversationId) -> Vec<TrackedMessage> {
        self.tracker.conversation(conversation_id)
    }

    // -- Conversations --

    /// Subscribes to a conversation's documents so inbound messages are
    /// picked up and outbound statuses follow the counterpart. Watching an
    /// already watched conversation does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Remote`] if the subscription fails.
    pub async fn watch_conversation(&self, conversation_id: ConversationId) -> Result<(), EngineError> {
        if self.watched.lock().contains(&conversation_id) {
            return Ok(());
        }
        let query = Query::collection(self.config.collection.as_str())
            .where_eq(schema::CONVERSATION_ID, conversation_id.to_string());
        let mut feed = self.remote.subscribe(query).await?;
        if !self.watched.lock().insert(conversation_id) {
            // Lost a race with a concurrent watch; its feed suffices.
            return Ok(());
        }

        let reports = self.reports.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                if reports.send(Report::Change(event)).is_err() {
                    break;
                }
            }
            tracing::debug!(conversation_id = %conversation_id, "change feed ended");
        });
        self.tasks.lock().push(forwarder);
        tracing::info!(conversation_id = %conversation_id, "watching conversation");
        Ok(())
    }

    /// Called when the user opens a conversation: watches it and fails any
    /// message that has been stuck in `sending` too long. Returns how many
    /// messages were failed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Remote`] if the subscription fails.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<usize, EngineError> {
        self.watch_conversation(conversation_id).await?;
        Ok(self.tracker.sweep_stale())
    }

    /// Fails every message stuck in `sending` past the stale timeout.
    pub fn sweep_stale(&self) -> usize {
        self.tracker.sweep_stale()
    }

    // -- UI signals --

    /// Reports how much of a message is on screen right now.
    pub fn report_visibility(&self, message_id: MessageId, visible_fraction: f32) {
        self.report_visibility_sample(VisibilitySample {
            message_id,
            visible_fraction,
            at: self.clock.now(),
        });
    }

    /// Reports a timestamped visibility sample.
    pub fn report_visibility_sample(&self, sample: VisibilitySample) {
        if self.samples.send(sample).is_err() {
            tracing::debug!("receipt detector stopped, sample dropped");
        }
    }

    /// Records an app lifecycle change.
    pub fn set_app_state(&self, state: AppState) {
        self.lifecycle.set(state);
    }

    /// The lifecycle signal shared by the workers.
    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleSignal {
        &self.lifecycle
    }

    /// Feeds a platform link report to the connectivity monitor.
    pub fn report_link(&self, report: LinkReport) -> ConnectionQuality {
        self.connectivity.report(report)
    }

    /// The connectivity monitor.
    #[must_use]
    pub const fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    // -- Queue and propagator snapshots --

    /// Ids waiting in the offline queue.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.queue.pending_ids()
    }

    /// Watches the ids waiting in the offline queue.
    #[must_use]
    pub fn watch_pending(&self) -> watch::Receiver<Vec<MessageId>> {
        self.queue.watch_pending()
    }

    /// Full copy of the offline queue.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if the queue worker has stopped.
    pub async fn pending_sends(&self) -> Result<Vec<PendingSend>, EngineError> {
        Ok(self.queue.snapshot().await?)
    }

    /// Persists the offline queue now.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Queue`] if persisting fails.
    pub async fn flush_outbox(&self) -> Result<(), EngineError> {
        Ok(self.queue.flush().await?)
    }

    /// Status updates waiting to be written.
    #[must_use]
    pub fn propagator_depth(&self) -> usize {
        self.propagator.depth()
    }

    /// Watches the propagator depth.
    #[must_use]
    pub fn watch_propagator_depth(&self) -> watch::Receiver<usize> {
        self.propagator.watch_depth()
    }

    /// Persists the queue, drains pending status updates and stops every
    /// worker.
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
        self.propagator.shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("delivery engine stopped");
    }
}
