//! WebSocket client for `courier-docstore`.
//!
//! Implements [`RemoteStore`] over one WebSocket connection. Requests carry
//! a client-chosen id; a background reader task routes each reply to the
//! waiting request and each change event to its subscription's feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use courier_proto::docstore::{self, ClientFrame, ServerFrame, StoreErrorKind};
use courier_proto::document::{ChangeEvent, DocumentId, Fields, Query};

use super::{ChangeFeed, RemoteError, RemoteStore};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeout for establishing the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single request/reply exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Routing tables shared with the reader task.
#[derive(Default)]
struct Routes {
    /// Requests waiting for their reply.
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>,
    /// Feeds created by `subscribe`, waiting for `Subscribed`.
    opening: Mutex<HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>>,
    /// Live feeds by subscription id.
    feeds: Mutex<HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>>,
}

/// [`RemoteStore`] backed by a `courier-docstore` server.
pub struct WsRemoteStore {
    /// Server URL (ws:// or wss://).
    url: String,
    /// Write half of the connection, shared by concurrent requests.
    ws_sender: tokio::sync::Mutex<WsSender>,
    /// Reply and feed routing.
    routes: Arc<Routes>,
    /// Whether the connection is still up.
    connected: Arc<AtomicBool>,
    /// Next request id.
    next_request: AtomicU64,
    /// Per-request reply timeout.
    request_timeout: Duration,
    /// Background reader task (kept alive for the store's lifetime).
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsRemoteStore {
    /// Connects to a docstore server.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::Timeout`] if the connection is not established in time.
    /// - [`RemoteError::Network`] if the server cannot be reached.
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, RemoteError> {
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "docstore WebSocket connect timed out");
                RemoteError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, error = %e, "docstore WebSocket connect failed");
                map_ws_connect_error(e)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let routes = Arc::new(Routes::default());
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&routes),
            Arc::clone(&connected),
        ));

        tracing::info!(url, "connected to docstore");

        Ok(Self {
            url: url.to_string(),
            ws_sender: tokio::sync::Mutex::new(ws_sender),
            routes,
            connected,
            next_request: AtomicU64::new(1),
            request_timeout,
            reader_handle,
        })
    }

    /// Server URL this store is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a frame without waiting for a reply.
    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::Closed);
        }
        let bytes = docstore::encode_client(frame)
            .map_err(|e| RemoteError::Rejected(format!("encode failed: {e}")))?;
        let mut sender = self.ws_sender.lock().await;
        sender
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "docstore send failed");
                self.connected.store(false, Ordering::Relaxed);
                RemoteError::Closed
            })
    }

    /// Sends a request and waits for the reply carrying the same id.
    async fn request(
        &self,
        request_id: u64,
        frame: ClientFrame,
    ) -> Result<ServerFrame, RemoteError> {
        let (tx, rx) = oneshot::channel();
        self.routes.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send_frame(&frame).await {
            self.forget(request_id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(RemoteError::Closed),
            Err(_) => {
                self.forget(request_id);
                tracing::warn!(request_id, "docstore request timed out");
                return Err(RemoteError::Timeout);
            }
        };

        match reply {
            ServerFrame::Error { kind, reason, .. } => Err(map_store_error(kind, reason)),
            other => Ok(other),
        }
    }

    fn forget(&self, request_id: u64) {
        self.routes.pending.lock().remove(&request_id);
        self.routes.opening.lock().remove(&request_id);
    }
}

impl Drop for WsRemoteStore {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl RemoteStore for WsRemoteStore {
    async fn create(&self, collection: &str, fields: Fields) -> Result<DocumentId, RemoteError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::Create {
            request_id,
            collection: collection.to_string(),
            fields,
        };
        match self.request(request_id, frame).await? {
            ServerFrame::Created { doc_id, .. } => Ok(doc_id),
            other => Err(unexpected(&other)),
        }
    }

    async fn update(
        &self,
        collection: &str,
        doc_id: &DocumentId,
        fields: Fields,
    ) -> Result<(), RemoteError> {
        let request_id = self.next_request_id();
        let frame = ClientFrame::Update {
            request_id,
            collection: collection.to_string(),
            doc_id: doc_id.clone(),
            fields,
        };
        match self.request(request_id, frame).await? {
            ServerFrame::Updated { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self, query: Query) -> Result<ChangeFeed, RemoteError> {
        let request_id = self.next_request_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered before sending so no change can outrun the feed.
        self.routes.opening.lock().insert(request_id, tx);

        let reply = self
            .request(request_id, ClientFrame::Subscribe { request_id, query })
            .await;
        match reply {
            Ok(ServerFrame::Subscribed {
                subscription_id, ..
            }) => {
                tracing::debug!(subscription_id, "docstore subscription open");
                Ok(rx)
            }
            Ok(other) => {
                self.forget(request_id);
                Err(unexpected(&other))
            }
            Err(e) => {
                self.forget(request_id);
                Err(e)
            }
        }
    }
}

/// Background task that reads server frames and routes them.
///
/// Malformed frames are logged and skipped. When the connection ends every
/// waiting request fails with [`RemoteError::Closed`] and every feed ends.
async fn reader_loop(mut ws_reader: WsReader, routes: Arc<Routes>, connected: Arc<AtomicBool>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match docstore::decode_server(&data) {
                Ok(frame) => route_frame(&routes, frame),
                Err(e) => tracing::warn!(error = %e, "malformed docstore frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("docstore WebSocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "docstore WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    routes.pending.lock().clear();
    routes.opening.lock().clear();
    routes.feeds.lock().clear();
    tracing::info!("docstore reader task exiting");
}

fn route_frame(routes: &Routes, frame: ServerFrame) {
    let request_id = match &frame {
        ServerFrame::Change {
            subscription_id,
            event,
        } => {
            let mut feeds = routes.feeds.lock();
            let delivered = feeds
                .get(subscription_id)
                .is_some_and(|tx| tx.send(event.clone()).is_ok());
            if !delivered {
                feeds.remove(subscription_id);
                tracing::debug!(subscription_id, "change for closed subscription dropped");
            }
            return;
        }
        ServerFrame::Subscribed {
            request_id,
            subscription_id,
        } => {
            if let Some(tx) = routes.opening.lock().remove(request_id) {
                routes.feeds.lock().insert(*subscription_id, tx);
            }
            Some(*request_id)
        }
        ServerFrame::Created { request_id, .. } | ServerFrame::Updated { request_id } => {
            Some(*request_id)
        }
        ServerFrame::Error { request_id, .. } => *request_id,
    };

    match request_id.and_then(|id| routes.pending.lock().remove(&id)) {
        Some(waiter) => {
            let _ = waiter.send(frame);
        }
        None => tracing::debug!(?frame, "docstore reply without a waiting request"),
    }
}

fn map_store_error(kind: StoreErrorKind, reason: String) -> RemoteError {
    match kind {
        StoreErrorKind::Rejected | StoreErrorKind::Malformed => RemoteError::Rejected(reason),
        StoreErrorKind::QuotaExceeded => RemoteError::QuotaExceeded,
        StoreErrorKind::NotFound => RemoteError::NotFound(reason),
    }
}

fn unexpected(frame: &ServerFrame) -> RemoteError {
    tracing::warn!(?frame, "unexpected docstore reply");
    RemoteError::Network("unexpected reply from docstore".into())
}

/// Map a `tokio_tungstenite` connection error to a [`RemoteError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> RemoteError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => {
            RemoteError::Network(format!("docstore HTTP error: status {}", response.status()))
        }
        WsError::Tls(_) => RemoteError::Network(format!("TLS error: {err}")),
        other => RemoteError::Network(other.to_string()),
    }
}
