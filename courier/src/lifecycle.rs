//! Foreground/background signal shared by the dispatch loop and the
//! read-receipt detector.

use std::sync::Arc;

use tokio::sync::watch;

/// Whether the app is on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AppState {
    /// On screen and interactive.
    #[default]
    Foreground,
    /// Not visible to the user.
    Background,
}

/// Injected app lifecycle state.
#[derive(Debug, Clone)]
pub struct LifecycleSignal {
    tx: Arc<watch::Sender<AppState>>,
}

impl Default for LifecycleSignal {
    fn default() -> Self {
        Self::new(AppState::Foreground)
    }
}

impl LifecycleSignal {
    /// Creates a signal starting in `initial`.
    #[must_use]
    pub fn new(initial: AppState) -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(initial)),
        }
    }

    /// Records a lifecycle change. Setting the current state again is a
    /// no-op for watchers.
    pub fn set(&self, state: AppState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(state = ?state, "app lifecycle changed");
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> AppState {
        *self.tx.borrow()
    }

    /// Whether the app is in the foreground.
    #[must_use]
    pub fn is_foreground(&self) -> bool {
        self.current() == AppState::Foreground
    }

    /// Watches the state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }
}
