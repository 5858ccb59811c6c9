//! Shutdown signalling for the listener and its background tasks.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tells the listener to stop accepting and bounds how long its tasks may
/// take to wind down.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// A coordinator that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token the listener waits on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger, then wait up to `timeout` for `tasks`. Returns how many were
    /// still running at the deadline and had to be aborted.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
        self.trigger();
        info!(tasks = tasks.len(), ?timeout, "draining server tasks");

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, join_all(tasks)).await.is_ok() {
            return 0;
        }
        let stragglers: Vec<_> = aborts.into_iter().filter(|h| !h.is_finished()).collect();
        warn!(aborted = stragglers.len(), "server tasks outlived the drain timeout");
        for handle in &stragglers {
            handle.abort();
        }
        stragglers.len()
    }
}
