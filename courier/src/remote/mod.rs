//! Remote document store abstraction.
//!
//! Defines the [`RemoteStore`] trait the engine writes messages and status
//! updates through, and subscribes to for change events. Implementations:
//! - [`memory::InMemoryRemoteStore`]: shared in-process store for tests
//! - [`ws::WsRemoteStore`]: WebSocket client for `courier-docstore`

pub mod memory;
pub mod ws;

use courier_proto::document::{ChangeEvent, DocumentId, Fields, Query};
use tokio::sync::mpsc;

pub use memory::InMemoryRemoteStore;
pub use ws::WsRemoteStore;

/// Errors returned by a remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The store could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The store refused the document content.
    #[error("rejected by remote store: {0}")]
    Rejected(String),

    /// The caller exceeded its write allowance.
    #[error("write quota exceeded")]
    QuotaExceeded,

    /// The target document does not exist.
    #[error("document {0} not found")]
    NotFound(String),

    /// The connection to the store has been closed.
    #[error("connection closed")]
    Closed,

    /// The operation did not complete in time.
    #[error("remote operation timed out")]
    Timeout,
}

/// Stream of change events from one subscription.
///
/// Delivery is at-least-once: consumers must tolerate duplicates. The feed
/// ends when the subscription or the connection goes away.
pub type ChangeFeed = mpsc::UnboundedReceiver<ChangeEvent>;

/// Async document store with live queries.
pub trait RemoteStore: Send + Sync + 'static {
    /// Creates a document in `collection` and returns its store-assigned id.
    fn create(
        &self,
        collection: &str,
        fields: Fields,
    ) -> impl std::future::Future<Output = Result<DocumentId, RemoteError>> + Send;

    /// Merges `fields` into an existing document.
    fn update(
        &self,
        collection: &str,
        doc_id: &DocumentId,
        fields: Fields,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Starts a live query. The current result set arrives first as
    /// `Added` events.
    fn subscribe(
        &self,
        query: Query,
    ) -> impl std::future::Future<Output = Result<ChangeFeed, RemoteError>> + Send;
}
