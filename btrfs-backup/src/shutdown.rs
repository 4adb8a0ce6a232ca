//! Signal handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run's [`CancellationToken`]. Every external process
//! is bound to that token, so pipelines are killed and temp files on the
//! remote are removed before the process exits.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel everything bound to the token.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                warn!("Received SIGINT (Ctrl+C), aborting backup run...");
            }
            _ = terminate => {
                warn!("Received SIGTERM, aborting backup run...");
            }
            _ = self.token.cancelled() => return,
        }

        self.trigger();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.trigger();

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_once_cancelled() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();

        coordinator.wait_for_signal().await;
        assert!(coordinator.token().is_cancelled());
    }
}
