//! Lifecycle controller for graceful shutdown.
//!
//! Shutdown happens in two stages. `stop` fires on SIGINT/SIGTERM and
//! tells consumers to stop pulling new messages while in-flight
//! deliveries finish. `abort` fires after the grace period and cuts off
//! any delivery I/O still outstanding, so an unreachable provider
//! cannot hold the process open indefinitely.

use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide shutdown coordinator.
#[derive(Clone)]
pub struct Shutdown {
    stop: CancellationToken,
    abort: CancellationToken,
    grace: Duration,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        Self {
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            grace,
        }
    }

    /// Token cancelled when consumers should stop pulling messages.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Token cancelled when in-flight delivery I/O should be abandoned.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Begin shutdown: cancel `stop` now and `abort` after the grace
    /// period. Idempotent.
    pub fn begin(&self) {
        if self.stop.is_cancelled() {
            return;
        }

        self.stop.cancel();

        let abort = self.abort.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !abort.is_cancelled() {
                info!(grace_ms = grace.as_millis() as u64, "shutdown_grace_expired");
                abort.cancel();
            }
        });
    }

    /// Wait for SIGINT or SIGTERM, then begin shutdown.
    pub async fn listen_for_signals(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }

        self.begin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::{advance, pause};

    #[tokio::test]
    async fn test_begin_stops_immediately_aborts_after_grace() {
        pause();
        let shutdown = Shutdown::new(Duration::from_millis(500));
        let stop = shutdown.stop_token();
        let abort = shutdown.abort_token();

        assert!(!stop.is_cancelled());
        assert!(!abort.is_cancelled());

        shutdown.begin();
        assert!(stop.is_cancelled());
        assert!(!abort.is_cancelled());

        advance(Duration::from_millis(600)).await;
        abort.cancelled().await;
        assert!(abort.is_cancelled());
    }

    #[tokio::test]
    async fn test_in_flight_window_before_abort() {
        pause();
        let shutdown = Shutdown::new(Duration::from_millis(500));
        let abort = shutdown.abort_token();

        shutdown.begin();

        // Inside the grace period a delivery still has its cancellation
        // token un-fired
        advance(Duration::from_millis(100)).await;
        assert!(!abort.is_cancelled());
    }

    #[tokio::test]
    async fn test_begin_is_idempotent() {
        pause();
        let shutdown = Shutdown::new(Duration::from_millis(100));

        shutdown.begin();
        shutdown.begin();
        shutdown.begin();

        advance(Duration::from_millis(200)).await;
        shutdown.abort_token().cancelled().await;
        assert!(shutdown.stop_token().is_cancelled());
    }
}
