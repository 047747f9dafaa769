//! Network reachability monitor.
//!
//! Platform code feeds [`LinkReport`]s in; the monitor classifies them into
//! a [`ConnectionQuality`], publishes the current value on a watch channel
//! and fires a [`BecameOnline`] broadcast on every offline to online edge.

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Active links as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    /// Wired (or local) link is up.
    pub ethernet: bool,
    /// Wi-Fi link is up.
    pub wifi: bool,
    /// Cellular link is up.
    pub cellular: bool,
}

impl LinkReport {
    /// A report with every link down.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            ethernet: false,
            wifi: false,
            cellular: false,
        }
    }

    /// Best available quality. Wired beats wireless beats cellular.
    #[must_use]
    pub const fn classify(self) -> ConnectionQuality {
        if self.ethernet {
            ConnectionQuality::Excellent
        } else if self.wifi {
            ConnectionQuality::Good
        } else if self.cellular {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Offline
        }
    }
}

/// Classified network quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionQuality {
    /// No report received yet.
    #[default]
    Unknown,
    /// No usable link.
    Offline,
    /// Cellular only.
    Poor,
    /// Wi-Fi.
    Good,
    /// Wired.
    Excellent,
}

impl ConnectionQuality {
    /// Whether writes should be attempted. `Unknown` counts as online so a
    /// device without a platform listener still sends.
    #[must_use]
    pub const fn is_online(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Offline => "offline",
            Self::Poor => "poor",
            Self::Good => "good",
            Self::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

/// Fired when connectivity returns after being offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BecameOnline {
    /// Quality at the moment of reconnection.
    pub quality: ConnectionQuality,
}

/// Publishes classified connectivity.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    quality: watch::Sender<ConnectionQuality>,
    online: broadcast::Sender<BecameOnline>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Creates a monitor in the `Unknown` state.
    #[must_use]
    pub fn new() -> Self {
        let (online, _) = broadcast::channel(16);
        Self {
            quality: watch::Sender::new(ConnectionQuality::Unknown),
            online,
        }
    }

    /// Applies one platform report and returns the new quality.
    pub fn report(&self, report: LinkReport) -> ConnectionQuality {
        let next = report.classify();
        let previous = self.quality.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "connectivity changed");
        }
        if previous == ConnectionQuality::Offline && next.is_online() {
            // No subscribers is fine.
            let _ = self.online.send(BecameOnline { quality: next });
        }
        next
    }

    /// Current quality.
    #[must_use]
    pub fn current(&self) -> ConnectionQuality {
        *self.quality.borrow()
    }

    /// Watches the current quality.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionQuality> {
        self.quality.subscribe()
    }

    /// Subscribes to offline to online edges.
    #[must_use]
    pub fn subscribe_online(&self) -> broadcast::Receiver<BecameOnline> {
        self.online.subscribe()
    }

    /// Applies reports from a platform listener until its channel closes.
    pub fn spawn_listener(&self, mut reports: mpsc::UnboundedReceiver<LinkReport>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                monitor.report(report);
            }
            tracing::debug!("link report listener stopped");
        })
    }
}
