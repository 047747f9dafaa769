//! Docstore server core: shared state, WebSocket handler, and request
//! dispatch.
//!
//! Each connection gets a writer task fed by an unbounded channel. Replies
//! and subscription changes share that channel, so a client sees a
//! subscription's snapshot before any change that follows it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use courier_proto::docstore::{self, ClientFrame, ServerFrame, StoreErrorKind};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::documents::DocumentStore;
use crate::quota::WriteQuota;

/// Default writes one connection may make per minute.
pub const DEFAULT_WRITES_PER_MINUTE: u32 = 600;

/// Shared server state.
#[derive(Debug)]
pub struct DocstoreState {
    /// All documents and live queries.
    pub documents: DocumentStore,
    writes_per_minute: u32,
    next_connection: AtomicU64,
}

impl Default for DocstoreState {
    fn default() -> Self {
        Self::new()
    }
}

impl DocstoreState {
    /// Creates a state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DocumentStore::new(), DEFAULT_WRITES_PER_MINUTE)
    }

    /// Creates a state over `documents` with a per-connection write quota.
    #[must_use]
    pub const fn with_config(documents: DocumentStore, writes_per_minute: u32) -> Self {
        Self {
            documents,
            writes_per_minute,
            next_connection: AtomicU64::new(1),
        }
    }
}

/// Handles one upgraded WebSocket connection until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<DocstoreState>) {
    let connection = state.next_connection.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    tracing::info!(connection, "client connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match docstore::encode_server(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(connection, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                tracing::warn!(connection, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        let mut quota = WriteQuota::per_minute(reader_state.writes_per_minute);
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(connection, &data, &reader_state, &mut quota, &tx).await;
                }
                Message::Close(_) => {
                    tracing::info!(connection, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.documents.drop_connection(connection).await;
    tracing::info!(connection, "client disconnected");
}

async fn handle_binary_message(
    connection: u64,
    data: &[u8],
    state: &DocstoreState,
    quota: &mut WriteQuota,
    tx: &mpsc::UnboundedSender<ServerFrame>,
) {
    let frame = match docstore::decode_client(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(connection, error = %e, "failed to decode frame");
            let _ = tx.send(ServerFrame::Error {
                request_id: None,
                kind: StoreErrorKind::Malformed,
                reason: e.to_string(),
            });
            return;
        }
    };

    let reply = match frame {
        ClientFrame::Create {
            request_id,
            collection,
            fields,
        } => {
            if !quota.try_acquire(Instant::now()) {
                tracing::warn!(connection, "write quota exceeded");
                Some(quota_error(request_id))
            } else {
                Some(match state.documents.create(&collection, fields).await {
                    Ok(doc_id) => ServerFrame::Created { request_id, doc_id },
                    Err(e) => {
                        tracing::debug!(connection, error = %e, "create refused");
                        ServerFrame::Error {
                            request_id: Some(request_id),
                            kind: e.kind(),
                            reason: e.to_string(),
                        }
                    }
                })
            }
        }
        ClientFrame::Update {
            request_id,
            collection,
            doc_id,
            fields,
        } => {
            if !quota.try_acquire(Instant::now()) {
                tracing::warn!(connection, "write quota exceeded");
                Some(quota_error(request_id))
            } else {
                Some(match state.documents.update(&collection, &doc_id, fields).await {
                    Ok(()) => ServerFrame::Updated { request_id },
                    Err(e) => {
                        tracing::debug!(connection, error = %e, "update refused");
                        ServerFrame::Error {
                            request_id: Some(request_id),
                            kind: e.kind(),
                            reason: e.to_string(),
                        }
                    }
                })
            }
        }
        ClientFrame::Subscribe { request_id, query } => {
            let subscription_id = state
                .documents
                .subscribe(connection, request_id, query, tx.clone())
                .await;
            tracing::debug!(connection, subscription_id, "subscription opened");
            None
        }
        ClientFrame::Unsubscribe { subscription_id } => {
            if !state.documents.unsubscribe(connection, subscription_id).await {
                tracing::debug!(connection, subscription_id, "unsubscribe for unknown subscription");
            }
            None
        }
    };

    if let Some(reply) = reply {
        let _ = tx.send(reply);
    }
}

fn quota_error(request_id: u64) -> ServerFrame {
    ServerFrame::Error {
        request_id: Some(request_id),
        kind: StoreErrorKind::QuotaExceeded,
        reason: "write quota exceeded, retry later".to_string(),
    }
}

/// Starts the docstore on the given address with default limits and
/// returns the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(DocstoreState::new())).await
}

/// Starts the docstore with a pre-configured [`DocstoreState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<DocstoreState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "docstore server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<DocstoreState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
