//! Graceful shutdown handling
//!
//! Listens for SIGTERM and SIGINT and coordinates shutdown of the
//! server components. The signal itself is a [`CancelToken`], the same
//! primitive requests use for per-call cancellation.

use log::{info, warn};
use tokio::time::Duration;

use crate::shared::cancel::CancelToken;

/// Process-wide shutdown signal shared across tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancelToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown. Safe to call more than once.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("🛑 Shutdown signal triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until shutdown is triggered.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Start listening for SIGTERM/SIGINT in the background.
    pub fn start_signal_listener(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            listen_for_shutdown_signals(signal).await;
        });
    }

    /// Wait for shutdown, then run `cleanup` bounded by `timeout`.
    /// Returns false when cleanup ran out of time.
    pub async fn shutdown_with_cleanup<F, Fut>(&self, timeout: Duration, cleanup: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        self.wait().await;

        info!("⏳ Starting graceful shutdown (timeout: {}s)...", timeout.as_secs());

        match tokio::time::timeout(timeout, cleanup()).await {
            Ok(()) => {
                info!("✅ Graceful shutdown completed");
                true
            }
            Err(_) => {
                warn!("⚠️ Graceful shutdown timed out after {}s", timeout.as_secs());
                false
            }
        }
    }
}

/// Listen for shutdown signals (SIGTERM, SIGINT) and trigger `shutdown`.
pub async fn listen_for_shutdown_signals(shutdown: ShutdownSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("📡 Received SIGINT signal (Ctrl+C)");
            }
        }

        shutdown.trigger();
    }

    #[cfg(not(unix))]
    {
        use tokio::signal::ctrl_c;

        ctrl_c().await.expect("Failed to install Ctrl+C handler");
        info!("📡 Received Ctrl+C signal");
        shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_releases_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        signal.trigger();
        handle.await.unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn cleanup_runs_within_timeout() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let clean = signal
            .shutdown_with_cleanup(Duration::from_secs(1), || async {})
            .await;
        assert!(clean);
    }

    #[tokio::test]
    async fn slow_cleanup_reports_timeout() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let clean = signal
            .shutdown_with_cleanup(Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert!(!clean);
    }
}
