//! In-memory document table with live queries.
//!
//! Documents are grouped by collection and identified by a server-assigned
//! [`DocumentId`]. Each subscription pushes [`ServerFrame::Change`] frames
//! into its connection's outbound channel whenever a write changes whether
//! or how a document matches the subscription's query.

use std::collections::HashMap;

use courier_proto::docstore::{ServerFrame, StoreErrorKind};
use courier_proto::document::{self, ChangeEvent, ChangeKind, DocumentId, Fields, Query};
use courier_proto::schema::{self, SchemaError};
use tokio::sync::{RwLock, mpsc};

/// Default largest document, in approximate encoded bytes (64 KB).
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 64 * 1024;

/// Why a write was refused.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The document would be larger than allowed.
    #[error("document too large: {size} bytes (max {max})")]
    TooLarge {
        /// Approximate size of the resulting document.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The message content is invalid.
    #[error("invalid document: {0}")]
    Invalid(#[from] SchemaError),

    /// The document to update does not exist.
    #[error("no document {0}")]
    NotFound(DocumentId),
}

impl StoreError {
    /// Wire classification of this error.
    #[must_use]
    pub const fn kind(&self) -> StoreErrorKind {
        match self {
            Self::TooLarge { .. } | Self::Invalid(_) => StoreErrorKind::Rejected,
            Self::NotFound(_) => StoreErrorKind::NotFound,
        }
    }
}

#[derive(Debug)]
struct Stored {
    /// Creation order, used to replay snapshots oldest first.
    seq: u64,
    fields: Fields,
}

#[derive(Debug)]
struct Subscription {
    connection: u64,
    query: Query,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<(String, DocumentId), Stored>,
    next_seq: u64,
    subscriptions: HashMap<u64, Subscription>,
    next_subscription: u64,
}

/// Shared document table.
#[derive(Debug)]
pub struct DocumentStore {
    inner: RwLock<Inner>,
    max_document_size: usize,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore {
    /// Creates an empty store with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_document_size(DEFAULT_MAX_DOCUMENT_SIZE)
    }

    /// Creates an empty store with a custom size limit.
    #[must_use]
    pub fn with_max_document_size(max_document_size: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_document_size,
        }
    }

    /// Stores a new document and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TooLarge`] or [`StoreError::Invalid`] if the
    /// document is refused.
    pub async fn create(&self, collection: &str, fields: Fields) -> Result<DocumentId, StoreError> {
        self.check(&fields)?;

        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let doc_id = DocumentId::new(format!("doc-{seq}"));
        inner.notify(collection, &doc_id, None, &fields);
        inner
            .documents
            .insert((collection.to_string(), doc_id.clone()), Stored { seq, fields });
        drop(inner);

        tracing::debug!(collection, doc_id = %doc_id, "document created");
        Ok(doc_id)
    }

    /// Merges `fields` into an existing document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown document, or
    /// [`StoreError::TooLarge`] / [`StoreError::Invalid`] if the merged
    /// document is refused.
    pub async fn update(
        &self,
        collection: &str,
        doc_id: &DocumentId,
        fields: Fields,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (collection.to_string(), doc_id.clone());
        let Some(stored) = inner.documents.get(&key) else {
            return Err(StoreError::NotFound(doc_id.clone()));
        };
        let before = stored.fields.clone();
        let mut after = before.clone();
        after.extend(fields);
        self.check(&after)?;

        inner.notify(collection, doc_id, Some(&before), &after);
        if let Some(stored) = inner.documents.get_mut(&key) {
            stored.fields = after;
        }
        drop(inner);

        tracing::debug!(collection, doc_id = %doc_id, "document updated");
        Ok(())
    }

    /// Starts a live query for `connection`.
    ///
    /// Sends [`ServerFrame::Subscribed`] and one `Added` change per matching
    /// document into `tx` before any later change can be observed, then
    /// returns the subscription id.
    pub async fn subscribe(
        &self,
        connection: u64,
        request_id: u64,
        query: Query,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) -> u64 {
        let mut inner = self.inner.write().await;
        inner.next_subscription += 1;
        let subscription_id = inner.next_subscription;

        let _ = tx.send(ServerFrame::Subscribed {
            request_id,
            subscription_id,
        });
        let mut matching: Vec<_> = inner
            .documents
            .iter()
            .filter(|((collection, _), stored)| query.matches(collection, &stored.fields))
            .collect();
        matching.sort_by_key(|(_, stored)| stored.seq);
        for ((_, doc_id), stored) in matching {
            let _ = tx.send(ServerFrame::Change {
                subscription_id,
                event: ChangeEvent {
                    kind: ChangeKind::Added,
                    doc_id: doc_id.clone(),
                    fields: stored.fields.clone(),
                },
            });
        }

        inner.subscriptions.insert(
            subscription_id,
            Subscription {
                connection,
                query,
                tx,
            },
        );
        subscription_id
    }

    /// Stops one live query. Only the owning connection may stop it.
    pub async fn unsubscribe(&self, connection: u64, subscription_id: u64) -> bool {
        let mut inner = self.inner.write().await;
        let owned = inner
            .subscriptions
            .get(&subscription_id)
            .is_some_and(|s| s.connection == connection);
        if owned {
            inner.subscriptions.remove(&subscription_id);
        }
        owned
    }

    /// Drops every live query of a closed connection.
    pub async fn drop_connection(&self, connection: u64) {
        let mut inner = self.inner.write().await;
        inner.subscriptions.retain(|_, s| s.connection != connection);
    }

    /// Current contents of a document.
    pub async fn get(&self, collection: &str, doc_id: &DocumentId) -> Option<Fields> {
        let inner = self.inner.read().await;
        inner
            .documents
            .get(&(collection.to_string(), doc_id.clone()))
            .map(|stored| stored.fields.clone())
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.inner.read().await.documents.len()
    }

    /// Number of live queries.
    pub async fn subscription_count(&self) -> usize {
        self.inner.read().await.subscriptions.len()
    }

    fn check(&self, fields: &Fields) -> Result<(), StoreError> {
        let size = document::approx_size(fields);
        if size > self.max_document_size {
            return Err(StoreError::TooLarge {
                size,
                max: self.max_document_size,
            });
        }
        schema::validate_document(fields)?;
        Ok(())
    }
}

impl Inner {
    fn notify(
        &mut self,
        collection: &str,
        doc_id: &DocumentId,
        before: Option<&Fields>,
        after: &Fields,
    ) {
        self.subscriptions.retain(|subscription_id, sub| {
            let was = before.is_some_and(|f| sub.query.matches(collection, f));
            let is = sub.query.matches(collection, after);
            let (kind, fields) = match (was, is) {
                (false, true) => (ChangeKind::Added, after),
                (true, true) => (ChangeKind::Modified, after),
                (true, false) => match before {
                    Some(before) => (ChangeKind::Removed, before),
                    None => return true,
                },
                (false, false) => return !sub.tx.is_closed(),
            };
            let frame = ServerFrame::Change {
                subscription_id: *subscription_id,
                event: ChangeEvent {
                    kind,
                    doc_id: doc_id.clone(),
                    fields: fields.clone(),
                },
            };
            sub.tx.send(frame).is_ok()
        });
    }
}
