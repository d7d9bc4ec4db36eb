//! Debounced registry persistence.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Single-slot debounced save: scheduling again before the delay elapses
/// replaces the pending save, so a burst of mutations collapses into one
/// write of the then-current snapshot.
#[derive(Debug, Default)]
pub(crate) struct DebouncedSaver {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedSaver {
    /// Schedules `save` to run after `delay`, replacing any pending save.
    pub(crate) fn schedule<F, Fut>(&self, delay: Duration, save: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            save().await;
        });
        let previous = self
            .pending
            .lock()
            .expect("saver slot poisoned")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancels any pending save.
    pub(crate) fn cancel(&self) {
        if let Some(handle) = self.pending.lock().expect("saver slot poisoned").take() {
            handle.abort();
        }
    }
}
