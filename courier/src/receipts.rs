//! Visibility-triggered read receipts.
//!
//! The UI reports how much of each message is on screen. A message counts
//! as seen once it has stayed at or above the visibility threshold for the
//! whole dwell time with the app in the foreground. Dropping below the
//! threshold or backgrounding the app cancels the pending mark.
//!
//! The detector keeps no memory of past sightings. A message that stays on
//! screen is reported again after every dwell; the state machine ignores
//! sightings of messages that are already read or not yet known.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use courier_proto::message::{MessageId, Timestamp};

use crate::clock::{self, Clock};
use crate::delivery::Report;
use crate::lifecycle::AppState;

/// One visibility observation from the UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilitySample {
    /// Message on screen.
    pub message_id: MessageId,
    /// Fraction of the message visible, `0.0..=1.0`.
    pub visible_fraction: f32,
    /// When the sample was taken.
    pub at: Timestamp,
}

/// Debounces visibility samples into confirmed sightings.
#[derive(Debug)]
pub struct DwellTracker {
    threshold: f32,
    dwell: Duration,
    /// Messages currently visible, with the time they became visible.
    candidates: HashMap<MessageId, Timestamp>,
    foreground: bool,
}

impl DwellTracker {
    /// Creates a tracker; the app starts in the foreground.
    #[must_use]
    pub fn new(threshold: f32, dwell: Duration) -> Self {
        Self {
            threshold,
            dwell,
            candidates: HashMap::new(),
            foreground: true,
        }
    }

    /// Applies one sample.
    pub fn observe(&mut self, sample: VisibilitySample) {
        if !self.foreground {
            return;
        }
        if sample.visible_fraction >= self.threshold {
            self.candidates
                .entry(sample.message_id)
                .or_insert(sample.at);
        } else if self.candidates.remove(&sample.message_id).is_some() {
            tracing::trace!(message_id = %sample.message_id, "visibility dwell cancelled");
        }
    }

    /// Records a lifecycle change. Backgrounding cancels every pending mark.
    pub fn set_foreground(&mut self, foreground: bool) {
        if !foreground {
            self.candidates.clear();
        }
        self.foreground = foreground;
    }

    /// Messages whose dwell completed by `now`. Their dwell ends here; the
    /// next visible sample starts a new one.
    pub fn due(&mut self, now: Timestamp) -> Vec<MessageId> {
        let mut due: Vec<_> = self
            .candidates
            .iter()
            .filter(|(_, since)| now.saturating_since(**since) >= self.dwell)
            .map(|(id, _)| *id)
            .collect();
        due.sort();
        for id in &due {
            self.candidates.remove(id);
        }
        due
    }

    /// When the earliest pending dwell completes.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.candidates
            .values()
            .min()
            .map(|since| since.saturating_add(self.dwell))
    }

    /// Whether a dwell is pending for `id`.
    #[must_use]
    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.candidates.contains_key(id)
    }
}

/// Worker turning visibility samples into [`Report::Seen`].
pub struct ReceiptDetector {
    dwell: DwellTracker,
    clock: Arc<dyn Clock>,
    reports: mpsc::UnboundedSender<Report>,
}

impl ReceiptDetector {
    /// Creates a detector reporting to `reports`.
    #[must_use]
    pub fn new(
        threshold: f32,
        dwell: Duration,
        clock: Arc<dyn Clock>,
        reports: mpsc::UnboundedSender<Report>,
    ) -> Self {
        Self {
            dwell: DwellTracker::new(threshold, dwell),
            clock,
            reports,
        }
    }

    /// Runs until the sample channel closes.
    pub async fn run(
        mut self,
        mut samples: mpsc::UnboundedReceiver<VisibilitySample>,
        mut lifecycle: watch::Receiver<AppState>,
    ) {
        self.dwell
            .set_foreground(*lifecycle.borrow_and_update() == AppState::Foreground);
        let mut lifecycle_open = true;

        loop {
            let deadline = self
                .dwell
                .next_deadline()
                .map(|at| clock::deadline_for(self.clock.as_ref(), at));
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                sample = samples.recv() => match sample {
                    Some(sample) => self.dwell.observe(sample),
                    None => break,
                },
                result = lifecycle.changed(), if lifecycle_open => {
                    if result.is_ok() {
                        let state = *lifecycle.borrow_and_update();
                        self.dwell.set_foreground(state == AppState::Foreground);
                    } else {
                        lifecycle_open = false;
                    }
                }
                () = timer => {}
            }

            for id in self.dwell.due(self.clock.now()) {
                tracing::debug!(message_id = %id, "message seen");
                if self.reports.send(Report::Seen(id)).is_err() {
                    return;
                }
            }
        }
        tracing::debug!("receipt detector stopped");
    }
}
