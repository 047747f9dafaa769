//! Offline queue of unacknowledged message writes.
//!
//! [`Outbox`] is the durable set of [`PendingSend`] entries, persisted to
//! [`LocalStorage`] on every change. [`dispatcher::Dispatcher`] owns it and
//! drives the writes; everything else talks to it through a
//! [`QueueHandle`].

pub mod backoff;
pub mod dispatcher;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use courier_proto::codec::{self, CodecError};
use courier_proto::delivery::PendingSend;
use courier_proto::message::{MessageId, Timestamp};

use crate::storage::{LocalStorage, StorageError};

pub use backoff::BackoffPolicy;
pub use dispatcher::{Dispatcher, QueueCommand, QueueHandle, Triggers};

/// Storage key of the persisted outbox.
pub const OUTBOX_KEY: &str = "outbox";

/// Errors that can occur in the offline queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The message already has a queue entry.
    #[error("message {0} is already queued")]
    Duplicate(MessageId),

    /// Persisting the outbox failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding the outbox failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The queue worker has stopped.
    #[error("queue worker has stopped")]
    Closed,
}

/// Durable set of pending writes, at most one per message.
pub struct Outbox {
    storage: Arc<dyn LocalStorage>,
    entries: BTreeMap<MessageId, PendingSend>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Outbox {
    /// Loads the outbox from `storage`.
    ///
    /// Corrupt records are dropped. An unreadable blob is logged and the
    /// outbox starts empty; the blob is overwritten by the next change.
    pub fn restore(storage: Arc<dyn LocalStorage>) -> Self {
        let entries = match storage.read(OUTBOX_KEY) {
            Ok(Some(bytes)) => match codec::decode_outbox(&bytes) {
                Ok(decoded) => {
                    if decoded.corrupt > 0 {
                        tracing::warn!(dropped = decoded.corrupt, "dropped corrupt outbox entries");
                    }
                    decoded
                        .entries
                        .into_iter()
                        .map(|entry| (*entry.id(), entry))
                        .collect()
                }
                Err(e) => {
                    tracing::error!(error = %e, "outbox unreadable, starting empty");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::error!(error = %e, "failed to read outbox, starting empty");
                BTreeMap::new()
            }
        };
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "restored pending sends");
        }
        Self { storage, entries }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the outbox is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&PendingSend> {
        self.entries.get(id)
    }

    /// All entries, ordered by message id.
    pub fn entries(&self) -> impl Iterator<Item = &PendingSend> {
        self.entries.values()
    }

    /// All queued message ids.
    #[must_use]
    pub fn ids(&self) -> Vec<MessageId> {
        self.entries.keys().copied().collect()
    }

    /// Adds a new entry and persists.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Duplicate`] if the message is already queued;
    /// the existing entry is kept.
    pub fn insert(&mut self, entry: PendingSend) -> Result<(), QueueError> {
        let id = *entry.id();
        if self.entries.contains_key(&id) {
            return Err(QueueError::Duplicate(id));
        }
        self.entries.insert(id, entry);
        self.persist_logged();
        Ok(())
    }

    /// Replaces an existing entry (after a failed attempt) and persists.
    /// Entries that are no longer queued are not re-added.
    pub fn replace(&mut self, entry: PendingSend) {
        if let Some(slot) = self.entries.get_mut(entry.id()) {
            *slot = entry;
            self.persist_logged();
        }
    }

    /// Removes an entry and persists.
    pub fn remove(&mut self, id: &MessageId) -> Option<PendingSend> {
        let removed = self.entries.remove(id);
        if removed.is_some() {
            self.persist_logged();
        }
        removed
    }

    /// Ids whose retry time has come, earliest first.
    #[must_use]
    pub fn due(&self, now: Timestamp) -> Vec<MessageId> {
        let mut due: Vec<_> = self.entries.values().filter(|e| e.is_due(now)).collect();
        due.sort_by_key(|e| (e.next_retry_at, e.queued_at));
        due.into_iter().map(|e| *e.id()).collect()
    }

    /// Earliest retry time among entries not in `skip`.
    #[must_use]
    pub fn next_due(&self, skip: &HashSet<MessageId>) -> Option<Timestamp> {
        self.entries
            .values()
            .filter(|e| !skip.contains(e.id()))
            .map(|e| e.next_retry_at)
            .min()
    }

    /// Makes every entry due at `now` at the latest.
    pub fn make_all_due(&mut self, now: Timestamp) {
        let mut changed = false;
        for entry in self.entries.values_mut() {
            if entry.next_retry_at > now {
                entry.next_retry_at = now;
                changed = true;
            }
        }
        if changed {
            self.persist_logged();
        }
    }

    /// Writes the outbox to storage.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if encoding or the storage write fails.
    pub fn persist(&self) -> Result<(), QueueError> {
        if self.entries.is_empty() {
            self.storage.remove(OUTBOX_KEY)?;
            return Ok(());
        }
        let blob = codec::encode_outbox(self.entries.values())?;
        self.storage.write(OUTBOX_KEY, &blob)?;
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            tracing::error!(error = %e, entries = self.entries.len(), "failed to persist outbox");
        }
    }
}
