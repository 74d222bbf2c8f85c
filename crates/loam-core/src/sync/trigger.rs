//! Wake-up signal for the synchronizer.

use std::sync::Arc;

use tokio::sync::Notify;

/// Requests another synchronization step.
///
/// Requests made while a step is running collapse into a single follow-up
/// step; they never start a second step concurrently.
#[derive(Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a step as soon as the current one (if any) finishes.
    pub fn request(&self) {
        self.notify.notify_one();
    }

    /// Wait for the next request.
    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}
