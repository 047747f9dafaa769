//! Courier: message delivery tracking for a chat client.
//!
//! Outbound messages move through `sending → sent → delivered → read`, or
//! end in `failed`. Writes survive restarts in a persisted outbox, retry
//! with exponential backoff, wait for connectivity, and back off further
//! under quota pressure. Read and delivery receipts are batched and written
//! back to the shared document store.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod propagator;
pub mod queue;
pub mod receipts;
pub mod remote;
pub mod storage;

pub use delivery::{Direction, FailureReason, MessageHandle, StatusChanged, StatusObserver, TrackedMessage};
pub use engine::{DeliveryEngine, EngineBuilder, EngineError};
