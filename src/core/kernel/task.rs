use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A spawned background task that is aborted when its owner drops it.
///
/// Renewal loops and connection drivers are held through this type so that
/// tearing down the owner can never leave a timer running against state that
/// no longer exists.
#[derive(Debug)]
pub struct ScheduledTask<T = ()> {
    name: &'static str,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> ScheduledTask<T> {
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            name,
            handle: Some(tokio::spawn(future)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Abort the task. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(task = self.name, "Cancelled scheduled task");
        }
    }

    /// Wait for the task to finish on its own. `None` if it was cancelled,
    /// panicked, or has already been joined.
    pub async fn join(&mut self) -> Option<T> {
        let handle = self.handle.as_mut()?;
        let output = handle.await.ok();
        self.handle = None;
        output
    }

    /// Wait up to `grace` for the task to finish, aborting it otherwise.
    pub async fn stop_within(&mut self, grace: Duration) -> Option<T> {
        let handle = self.handle.as_mut()?;
        match tokio::time::timeout(grace, handle).await {
            Ok(output) => {
                self.handle = None;
                output.ok()
            }
            Err(_) => {
                tracing::warn!(task = self.name, "Task did not stop in time, aborting");
                self.cancel();
                None
            }
        }
    }
}

impl<T> Drop for ScheduledTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
