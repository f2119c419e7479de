//! Tracked background tasks
//!
//! Every long-lived or fire-and-forget task a node starts goes through a
//! [`TaskGroup`], so shutdown can cancel them and wait for them to finish.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Group of tracked, cancellable tasks
#[derive(Clone, Default)]
pub struct TaskGroup {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TaskGroup {
    /// Create an empty group
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task; it receives the group's cancellation token
    ///
    /// Returns false without spawning once the group is shutting down.
    pub fn spawn<F, Fut>(&self, name: &'static str, f: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!("Not spawning {} during shutdown", name);
            return false;
        }
        self.tracker.spawn(f(self.token.child_token()));
        true
    }

    /// Check whether shutdown has started
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks still running
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Check whether no task is running
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Cancel every task and wait for all of them to finish
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
