//! Per-connection write quota.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding window over which writes are counted.
const WINDOW: Duration = Duration::from_secs(60);

/// Allows at most `limit` writes in any 60 second window.
#[derive(Debug)]
pub struct WriteQuota {
    limit: u32,
    recent: VecDeque<Instant>,
}

impl WriteQuota {
    /// Creates a quota of `limit` writes per minute. Zero disables the quota.
    #[must_use]
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            recent: VecDeque::new(),
        }
    }

    /// Records a write at `now` if the quota allows it.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        while self
            .recent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            self.recent.pop_front();
        }
        if self.recent.len() >= self.limit as usize {
            return false;
        }
        self.recent.push_back(now);
        true
    }
}
