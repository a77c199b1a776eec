//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::ServerState;

/// Default time allowed for sessions and tasks to finish after shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for connections to drain.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Coordinates shutdown of the accept loop and every live session.
///
/// Sessions watch [`ShutdownCoordinator::token`] and tear their connection
/// down through the normal disconnect path once it is cancelled.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not fired.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Start shutdown, then wait for every connection in `state` to finish
    /// teardown and for `handles` to complete.
    ///
    /// Gives up after `timeout` (default 30 s) and aborts whatever is left.
    /// Returns `true` if everything finished in time.
    pub async fn graceful_shutdown(
        &self,
        state: &ServerState,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        info!(
            connections = state.connection_count(),
            task_count = handles.len(),
            timeout_ms = timeout.as_millis(),
            "shutting down"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = async {
            while state.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
            let _ = futures::future::join_all(handles).await;
        };

        if tokio::time::timeout(timeout, drain).await.is_ok() {
            info!("shutdown complete");
            true
        } else {
            warn!(
                remaining = state.connection_count(),
                "shutdown timed out after {timeout:?}, aborting remaining tasks"
            );
            for abort in aborts {
                abort.abort();
            }
            false
        }
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
    use std::sync::Arc;

    use rally_core::JsonCodec;

    fn state() -> ServerState {
        ServerState::new(Arc::new(JsonCodec))
    }

    #[test]
    fn starts_idle() {
        assert!(!ShutdownCoordinator::default().is_shutting_down());
    }

    #[test]
    fn shutdown_cancels_every_token() {
        let coord = ShutdownCoordinator::new();
        let tokens = [coord.token(), coord.token()];
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });

        assert!(coord.graceful_shutdown(&state(), vec![handle], None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_times_out_and_aborts() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        let finished = coord
            .graceful_shutdown(&state(), vec![handle], Some(Duration::from_millis(100)))
            .await;
        assert!(!finished);
        assert!(coord.is_shutting_down());
    }
}
