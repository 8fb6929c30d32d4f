//! One-shot signals shared between tasks.
//!
//! A [`Signal`] latches once fired: every current and future waiter
//! observes it. Used for the per-connection disconnect notification and the
//! process-wide shutdown request.

use tokio::sync::watch;

/// A cloneable, fire-once latch.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Signal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only fails after a fire anyway.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
