//! Idle debounce between local writes and the synchronizer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sync::SyncTrigger;

/// Bounded queue of "something was written" notices plus the idle timer that
/// drains it.
///
/// The synchronizer is asked for a step once no write has arrived for one
/// full window. Dropping the debouncer (or calling [`Debouncer::stop`]) ends
/// the timer task; a pending window is flushed on the way out.
pub struct Debouncer {
    sender: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn spawn(window: Duration, capacity: usize, trigger: SyncTrigger) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(window, receiver, trigger));
        Self { sender, task }
    }

    /// Handle used by writers to report a committed write
    pub fn handle(&self) -> DebounceHandle {
        DebounceHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Writer side of a [`Debouncer`].
#[derive(Clone)]
pub struct DebounceHandle {
    sender: mpsc::Sender<()>,
}

impl DebounceHandle {
    /// Note a committed write. Never blocks: a full queue already guarantees
    /// a flush.
    pub fn touch(&self) {
        let _ = self.sender.try_send(());
    }
}

async fn run(window: Duration, mut receiver: mpsc::Receiver<()>, trigger: SyncTrigger) {
    while receiver.recv().await.is_some() {
        loop {
            match tokio::time::timeout(window, receiver.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => {
                    trigger.request();
                    return;
                }
                Err(_) => break,
            }
        }
        tracing::trace!("Debounce window elapsed, requesting sync");
        trigger.request();
    }
}
