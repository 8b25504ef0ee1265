//! Delayed video region refresh timer
//!
//! Holds at most one pending tokio task per window. Scheduling aborts any
//! pending task first, so a burst of reschedules only ever fires once.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Posted when a window's queued region refresh is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRequest {
    /// Window whose refresh fired
    pub window_id: u32,
    /// Delay the timer was armed with
    pub delay: Duration,
}

/// Cancellable one-shot refresh timer for one window
#[derive(Debug)]
pub struct RefreshTimer {
    window_id: u32,
    tx: UnboundedSender<RefreshRequest>,
    pending: Option<JoinHandle<()>>,
}

impl RefreshTimer {
    /// Create a timer posting to `tx`
    pub fn new(window_id: u32, tx: UnboundedSender<RefreshRequest>) -> Self {
        Self {
            window_id,
            tx,
            pending: None,
        }
    }

    /// Arm the timer, replacing any pending one
    ///
    /// Returns false when called outside a tokio runtime; nothing is armed
    /// in that case and the caller has to poll for due refreshes itself.
    pub fn schedule(&mut self, delay: Duration) -> bool {
        self.cancel();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No runtime available, refresh for window {} not scheduled",
                    self.window_id
                );
                return false;
            }
        };

        let tx = self.tx.clone();
        let window_id = self.window_id;
        trace!("refresh for window {} in {:?}", window_id, delay);
        self.pending = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // receiver gone means the window is being torn down
            let _ = tx.send(RefreshRequest { window_id, delay });
        }));
        true
    }

    /// Abort the pending timer, returning whether one was pending
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    /// True while a timer is armed and has not fired
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
