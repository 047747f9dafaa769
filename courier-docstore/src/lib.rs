//! Courier reference document store.
//!
//! An axum WebSocket server holding message documents in memory. Clients
//! create and update documents and subscribe to live queries; the server
//! validates content, enforces a per-connection write quota, and pushes
//! changes to every matching subscription.

pub mod config;
pub mod documents;
pub mod quota;
pub mod server;
