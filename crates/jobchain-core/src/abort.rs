//! The typed-reason abort signal handed to attempt handlers (§4.2, §5).
//!
//! Grounded on the source's closed-over-callback cancellation, replaced
//! here with a plain shared notify primitive per §9 ("Closed-over
//! callbacks ... replace with channels or notify primitives"). Backed by a
//! `tokio::sync::watch` channel rather than `Notify` so a late subscriber
//! still observes a reason that fired before it started watching.

use crate::error::AbortReason;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AbortSignal {
    tx: watch::Sender<Option<AbortReason>>,
    rx: watch::Receiver<Option<AbortReason>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx, rx }
    }

    /// Fire the signal with `reason`. The first reason to fire wins (§5);
    /// a later call with a different reason is ignored.
    pub fn fire(&self, reason: AbortReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.rx.borrow()
    }

    /// Resolves once a reason has been set. Handlers are expected to poll
    /// or await this at natural suspension points (§5); nothing forcibly
    /// cancels the handler's future.
    pub async fn aborted(&self) -> AbortReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = *rx.borrow() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever firing; block forever rather
                // than spin, mirroring a signal that will simply never
                // come.
                std::future::pending::<()>().await;
            }
        }
    }
}
