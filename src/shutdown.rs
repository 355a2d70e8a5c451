use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown coordinator for the fleet kernel.
///
/// Signals flip a shared [`CancellationToken`]; every periodic loop selects on it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGINT/SIGTERM (or a programmatic trigger), then cancel the token.
    pub async fn wait_for_signal(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received SIGINT");
                }
                _ = terminate.recv() => info!("Received SIGTERM"),
                _ = self.token.cancelled() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received ctrl-c");
                }
                _ = self.token.cancelled() => {}
            }
        }
        self.trigger();
        Ok(())
    }
}

/// Run one shutdown step, giving up after `limit`. Returns whether it finished in time.
pub async fn run_step<F, T>(name: &str, limit: Duration, step: F) -> Option<T>
where
    F: Future<Output = T>,
{
    info!(step = name, "Running shutdown step");
    match timeout(limit, step).await {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(step = name, timeout_secs = limit.as_secs(), "Shutdown step timed out");
            None
        }
    }
}
