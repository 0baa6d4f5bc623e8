//! Cancellation context threaded through endpoint calls and driver waits.

use std::sync::Arc;
use tokio::sync::watch;

/// A clonable cancellation token carrying the cancellation reason.
///
/// The first `cancel` wins; later calls are ignored. Every clone observes the
/// same cancellation state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<String>>>,
    rx: watch::Receiver<Option<String>>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancel the token, recording the reason. A second cancellation keeps
    /// the first reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The recorded cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Wait until the token is cancelled and return the reason.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.rx.clone();
        // Every clone holds the sender half, so the channel outlives all
        // possible waiters.
        let result = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::from("cancelled"),
        };
        result
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
