//! Graceful shutdown via `CancellationToken`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long background tasks get to finish once shutdown starts.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the shutdown signal and the tasks that must finish before exit.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// New coordinator with nothing tracked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for `handle` during [`graceful_shutdown`](Self::graceful_shutdown).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Cancel the token, then wait up to `timeout` for tracked tasks.
    /// Tasks still running afterwards are aborted. Returns whether every
    /// task finished in time.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> bool {
        self.token.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        info!(
            task_count = handles.len(),
            timeout_ms = timeout.as_millis(),
            "waiting for tasks to finish"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "shutdown timed out, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        assert!(!ShutdownCoordinator::new().is_shutting_down());
    }

    #[test]
    fn tokens_share_cancellation() {
        let coord = ShutdownCoordinator::new();
        let a = coord.token();
        let b = coord.token();
        coord.token.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn waits_for_tracked_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        coord.track(tokio::spawn(async move { token.cancelled().await }));

        assert!(coord.graceful_shutdown(Duration::from_secs(5)).await);
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn nothing_tracked_finishes_immediately() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.graceful_shutdown(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_task_is_aborted_after_timeout() {
        let coord = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        coord.track(tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(300)).await;
        }));

        assert!(!coord.graceful_shutdown(Duration::from_millis(100)).await);
        // aborting drops the task, and with it the sender
        assert!(rx.await.is_err());
    }
}
