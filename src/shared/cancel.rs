//! Cooperative cancellation
//!
//! A clonable token shared between a caller and whatever is working on
//! its behalf. All clones observe the same cancellation; firing it is
//! idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: broadcast::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire the token. Safe to call more than once.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            // Send errors just mean no one is listening yet
            let _ = self.sender.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves when the token fires; immediately if it already has.
    pub async fn cancelled(&self) {
        // Subscribe before checking the flag so a cancel landing in
        // between is not missed.
        let mut rx = self.sender.subscribe();
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
