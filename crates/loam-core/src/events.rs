//! Post-commit change notifications for live queries.
//!
//! Delivery is at-least-once and batched: every committed local-store
//! transaction publishes one batch with an event per affected row. A
//! subscriber that falls behind receives [`FeedError::Lagged`] and must
//! re-query whatever it is watching. Duplicate events for a row are normal.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of row-level mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEventKind {
    Created,
    Updated,
    Deleted,
}

/// One affected row of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub table: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: StoreEventKind,
    /// Whether the write replayed server changes
    pub from_remote: bool,
}

/// Reasons a subscriber could not receive the next batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("subscriber missed {0} batch(es)")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Publisher side of one execution context's change feed.
///
/// Writers in the context publish directly; commits from sibling contexts on
/// the same database arrive through [`crate::capture::SiblingRelay`].
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Vec<StoreEvent>>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish one committed batch; empty batches are skipped.
    pub fn publish(&self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        // No subscribers is fine: nothing is watching yet.
        let _ = self.sender.send(events);
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Subscriber side of the change feed.
pub struct ChangeSubscription {
    receiver: broadcast::Receiver<Vec<StoreEvent>>,
}

impl ChangeSubscription {
    /// Wait for the next committed batch.
    pub async fn next_batch(&mut self) -> Result<Vec<StoreEvent>, FeedError> {
        self.receiver.recv().await.map_err(|error| match error {
            broadcast::error::RecvError::Lagged(missed) => FeedError::Lagged(missed),
            broadcast::error::RecvError::Closed => FeedError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str) -> StoreEvent {
        StoreEvent {
            table: "notes".to_string(),
            key: key.to_string(),
            kind: StoreEventKind::Created,
            from_remote: false,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_batches() {
        let feed = ChangeFeed::new(4);
        let mut sub = feed.subscribe();

        feed.publish(vec![event("a"), event("b")]);
        feed.publish(Vec::new());
        feed.publish(vec![event("c")]);

        assert_eq!(sub.next_batch().await.unwrap().len(), 2);
        assert_eq!(sub.next_batch().await.unwrap()[0].key, "c");
    }

    #[tokio::test]
    async fn slow_subscriber_is_told_it_lagged() {
        let feed = ChangeFeed::new(1);
        let mut sub = feed.subscribe();

        feed.publish(vec![event("a")]);
        feed.publish(vec![event("b")]);

        assert_eq!(sub.next_batch().await, Err(FeedError::Lagged(1)));
        assert_eq!(sub.next_batch().await.unwrap()[0].key, "b");
    }
}
