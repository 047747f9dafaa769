//! Document model of the remote store.
//!
//! The remote store is schemaless: a document is a flat map of named
//! [`FieldValue`]s inside a named collection. Subscriptions select documents
//! with a [`Query`] and receive [`ChangeEvent`]s.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::Timestamp;

/// Identifier assigned by the remote store to a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wraps a store-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicit absence.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Millisecond timestamp.
    Timestamp(Timestamp),
}

impl FieldValue {
    /// Returns the text if this is a [`FieldValue::Text`].
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the timestamp if this is a [`FieldValue::Timestamp`].
    #[must_use]
    pub const fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Returns the integer if this is a [`FieldValue::Int`].
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Rough encoded size, used for server-side document limits.
    #[must_use]
    pub const fn approx_size(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) => 1,
            Self::Int(_) | Self::Timestamp(_) => 8,
            Self::Text(s) => s.len(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Timestamp> for FieldValue {
    fn from(ts: Timestamp) -> Self {
        Self::Timestamp(ts)
    }
}

/// Field map of a document. Ordered so encodings are deterministic.
pub type Fields = BTreeMap<String, FieldValue>;

/// Rough encoded size of a whole field map.
#[must_use]
pub fn approx_size(fields: &Fields) -> usize {
    fields.iter().map(|(k, v)| k.len() + v.approx_size()).sum()
}

/// Equality filter on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Field name.
    pub field: String,
    /// Required value.
    pub equals: FieldValue,
}

/// Selects documents of one collection, optionally filtered by one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Collection to watch.
    pub collection: String,
    /// Optional equality filter.
    pub filter: Option<FieldFilter>,
}

impl Query {
    /// Selects every document in `collection`.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
        }
    }

    /// Restricts the query to documents whose `field` equals `value`.
    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filter = Some(FieldFilter {
            field: field.into(),
            equals: value.into(),
        });
        self
    }

    /// Whether a document in `collection` with `fields` matches.
    #[must_use]
    pub fn matches(&self, collection: &str, fields: &Fields) -> bool {
        if self.collection != collection {
            return false;
        }
        self.filter
            .as_ref()
            .is_none_or(|f| fields.get(&f.field) == Some(&f.equals))
    }
}

/// Kind of change reported by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Document entered the result set (including the initial snapshot).
    Added,
    /// Document in the result set changed.
    Modified,
    /// Document left the result set.
    Removed,
}

/// One change delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened.
    pub kind: ChangeKind,
    /// Document id.
    pub doc_id: DocumentId,
    /// Full document after the change (before it, for `Removed`).
    pub fields: Fields,
}
