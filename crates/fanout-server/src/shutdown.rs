//! Shutdown coordination.
//!
//! One [`CancellationToken`] fans out to the listener, every connection,
//! the relay listener, and the lease task. Connections hold a
//! [`TaskTrackerToken`] while they run, so [`ShutdownCoordinator::drain`]
//! waits for their registry removal and presence retract, not just for
//! the listener to stop.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Host-wide cancellation plus a count of connections still cleaning up.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    connections: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator with nothing tracked.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Host-wide token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Mark one connection as live until the returned token is dropped.
    pub fn track_connection(&self) -> TaskTrackerToken {
        self.connections.token()
    }

    /// Connections that have not finished cleanup.
    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }

    /// Cancel everything. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then wait for `tasks` and every tracked connection.
    ///
    /// Gives up after `timeout` (30s by default) and reports how many
    /// connections were still cleaning up.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DRAIN_TIMEOUT);
        self.shutdown();
        let _ = self.connections.close();
        info!(
            tasks = tasks.len(),
            connections = self.connections.len(),
            timeout_secs = timeout.as_secs(),
            "draining"
        );

        let all = async {
            let _ = futures::future::join_all(tasks).await;
            self.connections.wait().await;
        };
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!(
                connections = self.connections.len(),
                "drain timed out after {timeout:?}"
            );
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
