//! Task supervision for one binding.
//!
//! Every task a binding starts (its accept loop, and one task per session)
//! is spawned through the binding's [`Graceful`], so closing the binding can
//! signal all of them and wait until the last one has exited.

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct Graceful {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Graceful {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that `shutdown` will wait for.
    pub fn spawn<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token cancelled together with this supervisor, for one session.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
