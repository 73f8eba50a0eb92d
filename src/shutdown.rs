//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] is cloned into every long-running task: the HTTP
//! server, the consumer loops, the response router and the reconnect
//! supervisor. Once triggered it stays triggered, so a task that starts
//! waiting after the fact still observes it.
//!
//! # Example
//!
//! ```rust,ignore
//! use tranquara_relay::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let worker_shutdown = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = worker_shutdown.cancelled() => break,
//!             // ... receive deliveries
//!         }
//!     }
//! });
//!
//! shutdown.listen_for_signals().await;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    /// How long background tasks get to finish after the signal
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM or SIGINT, then trigger shutdown.
    pub async fn listen_for_signals(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.cancelled() => {
                return;
            }
        }

        self.trigger();
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown triggered");
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
