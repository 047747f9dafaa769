//! Wall-clock source for timestamps and deadlines.
//!
//! Timestamps recorded on messages come from a [`Clock`]. Workers schedule
//! their timers as tokio deadlines derived from those timestamps, so the
//! default [`TokioClock`] follows tokio's time: under a paused test runtime,
//! advancing time moves both together.

use courier_proto::message::Timestamp;
use tokio::time::Instant;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Timestamp;
}

/// Wall clock anchored to a tokio [`Instant`].
///
/// Reports `base + elapsed`, where `elapsed` is measured on tokio's clock.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base: Timestamp,
    anchor: Instant,
}

impl TokioClock {
    /// Anchors at the current system time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Timestamp::now())
    }

    /// Anchors at a fixed wall-clock time.
    #[must_use]
    pub fn starting_at(base: Timestamp) -> Self {
        Self {
            base,
            anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.base.saturating_add(self.anchor.elapsed())
    }
}

/// Converts a wall-clock deadline into a tokio deadline.
///
/// Deadlines in the past map to "now".
#[must_use]
pub fn deadline_for(clock: &dyn Clock, at: Timestamp) -> Instant {
    Instant::now() + at.saturating_since(clock.now())
}
