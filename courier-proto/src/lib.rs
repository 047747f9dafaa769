//! Shared data model and wire formats for Courier delivery tracking.

pub mod codec;
pub mod delivery;
pub mod docstore;
pub mod document;
pub mod message;
pub mod schema;
