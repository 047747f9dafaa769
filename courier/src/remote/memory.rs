//! In-process [`RemoteStore`] shared by several engines.
//!
//! Two engines holding clones of the same [`InMemoryRemoteStore`] behave
//! like two devices talking through a hosted document store. The store can
//! be told to fail, go offline, slow down, or deliver every change twice.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use courier_proto::document::{ChangeEvent, ChangeKind, DocumentId, Fields, Query};
use courier_proto::schema;

use super::{ChangeFeed, RemoteError, RemoteStore};

/// Shared in-memory document store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemoteStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    documents: BTreeMap<(String, DocumentId), Fields>,
    subscribers: Vec<Subscriber>,
    injected: VecDeque<RemoteError>,
    offline: bool,
    duplicate_events: bool,
    latency: Duration,
    writes_in_flight: usize,
    peak_writes_in_flight: usize,
    updates: Vec<(DocumentId, Fields)>,
}

#[derive(Debug)]
struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// Decrements the in-flight write counter when dropped.
struct WriteGuard<'a>(&'a Mutex<Inner>);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.0.lock();
        inner.writes_in_flight = inner.writes_in_flight.saturating_sub(1);
    }
}

impl InMemoryRemoteStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next write fail with `err`. Calls queue up in order.
    pub fn fail_next(&self, err: RemoteError) {
        self.inner.lock().injected.push_back(err);
    }

    /// Makes every write and subscribe fail with a network error while set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Delivers every change event twice while set.
    pub fn set_duplicate_events(&self, duplicate: bool) {
        self.inner.lock().duplicate_events = duplicate;
    }

    /// Delays every write by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Reads a document.
    #[must_use]
    pub fn document(&self, collection: &str, doc_id: &DocumentId) -> Option<Fields> {
        self.inner
            .lock()
            .documents
            .get(&(collection.to_string(), doc_id.clone()))
            .cloned()
    }

    /// All documents of a collection, in creation order.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<(DocumentId, Fields)> {
        let mut docs: Vec<_> = self
            .inner
            .lock()
            .documents
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, id), fields)| (id.clone(), fields.clone()))
            .collect();
        docs.sort_by_key(|(id, _)| doc_seq(id));
        docs
    }

    /// Every successful update, in order.
    #[must_use]
    pub fn updates(&self) -> Vec<(DocumentId, Fields)> {
        self.inner.lock().updates.clone()
    }

    /// Highest number of writes observed running at once.
    #[must_use]
    pub fn peak_writes_in_flight(&self) -> usize {
        self.inner.lock().peak_writes_in_flight
    }

    /// Runs the common preamble of a write: latency, offline check and
    /// injected failures.
    async fn begin_write(&self) -> Result<WriteGuard<'_>, RemoteError> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.writes_in_flight += 1;
            inner.peak_writes_in_flight = inner.peak_writes_in_flight.max(inner.writes_in_flight);
            inner.latency
        };
        let guard = WriteGuard(&self.inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(RemoteError::Network("store unreachable".into()));
        }
        if let Some(err) = inner.injected.pop_front() {
            return Err(err);
        }
        drop(inner);
        Ok(guard)
    }
}

impl Inner {
    /// Sends the matching change to every live subscriber, dropping closed
    /// ones.
    fn notify(
        &mut self,
        collection: &str,
        doc_id: &DocumentId,
        before: Option<&Fields>,
        after: &Fields,
    ) {
        let duplicate = self.duplicate_events;
        self.subscribers.retain(|sub| {
            let was = before.is_some_and(|f| sub.query.matches(collection, f));
            let is = sub.query.matches(collection, after);
            let event = match (was, is) {
                (false, true) => Some((ChangeKind::Added, after)),
                (true, true) => Some((ChangeKind::Modified, after)),
                (true, false) => before.map(|f| (ChangeKind::Removed, f)),
                (false, false) => None,
            };
            let Some((kind, fields)) = event else {
                return !sub.tx.is_closed();
            };
            let event = ChangeEvent {
                kind,
                doc_id: doc_id.clone(),
                fields: fields.clone(),
            };
            if duplicate && sub.tx.send(event.clone()).is_err() {
                return false;
            }
            sub.tx.send(event).is_ok()
        });
    }
}

impl RemoteStore for InMemoryRemoteStore {
    async fn create(&self, collection: &str, fields: Fields) -> Result<DocumentId, RemoteError> {
        let _guard = self.begin_write().await?;
        schema::validate_document(&fields).map_err(|e| RemoteError::Rejected(e.to_string()))?;

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let doc_id = DocumentId::new(format!("doc-{}", inner.next_id));
        inner.notify(collection, &doc_id, None, &fields);
        inner
            .documents
            .insert((collection.to_string(), doc_id.clone()), fields);
        drop(inner);

        tracing::debug!(collection, doc_id = %doc_id, "document created");
        Ok(doc_id)
    }

    async fn update(
        &self,
        collection: &str,
        doc_id: &DocumentId,
        fields: Fields,
    ) -> Result<(), RemoteError> {
        let _guard = self.begin_write().await?;

        let mut inner = self.inner.lock();
        let key = (collection.to_string(), doc_id.clone());
        let Some(before) = inner.documents.get(&key).cloned() else {
            return Err(RemoteError::NotFound(doc_id.to_string()));
        };
        let mut after = before.clone();
        after.extend(fields.clone());
        schema::validate_document(&after).map_err(|e| RemoteError::Rejected(e.to_string()))?;

        inner.notify(collection, doc_id, Some(&before), &after);
        inner.documents.insert(key, after);
        inner.updates.push((doc_id.clone(), fields));
        drop(inner);

        tracing::debug!(collection, doc_id = %doc_id, "document updated");
        Ok(())
    }

    async fn subscribe(&self, query: Query) -> Result<ChangeFeed, RemoteError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(RemoteError::Network("store unreachable".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut snapshot: Vec<_> = inner
            .documents
            .iter()
            .filter(|((c, _), fields)| query.matches(c, fields))
            .map(|((_, id), fields)| ChangeEvent {
                kind: ChangeKind::Added,
                doc_id: id.clone(),
                fields: fields.clone(),
            })
            .collect();
        snapshot.sort_by_key(|e| doc_seq(&e.doc_id));
        for event in snapshot {
            // Receiver is alive: we hold it.
            let _ = tx.send(event);
        }
        inner.subscribers.push(Subscriber { query, tx });
        Ok(rx)
    }
}

/// Creation sequence number encoded in an id like `doc-17`.
fn doc_seq(id: &DocumentId) -> u64 {
    id.as_str()
        .strip_prefix("doc-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}
