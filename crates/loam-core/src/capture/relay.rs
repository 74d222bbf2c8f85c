//! Commits made by sibling contexts, replayed into this context.
//!
//! Every context that opens a replica database records its committed batches
//! in `store_events`. A relay tails that log, republishes other contexts'
//! batches on the local change feed and wakes the local debouncer for their
//! local writes, so whichever context leads pushes them promptly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::db::{Database, EventLog, LibSqlEventLog};
use crate::error::Result;
use crate::events::ChangeFeed;
use crate::util::unix_millis_now;

use super::DebounceHandle;

/// Batches read per poll
const READ_LIMIT: usize = 256;

/// Logged batches older than this are pruned
const RETENTION: Duration = Duration::from_secs(300);

/// Polls between prune passes
const PRUNE_EVERY: u64 = 600;

/// Background tail of the shared event log for one context.
pub struct SiblingRelay {
    task: JoinHandle<()>,
}

impl SiblingRelay {
    /// Start relaying batches committed after now by contexts other than
    /// `context`.
    pub async fn start(
        db: Arc<Mutex<Database>>,
        context: impl Into<String>,
        feed: ChangeFeed,
        wake: Option<DebounceHandle>,
        interval: Duration,
    ) -> Result<Self> {
        let cursor = {
            let db = db.lock().await;
            LibSqlEventLog::new(db.connection()).latest_seq().await?
        };
        let task = tokio::spawn(run(
            db,
            context.into(),
            feed,
            wake,
            interval.max(Duration::from_millis(5)),
            cursor,
        ));
        Ok(Self { task })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SiblingRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    db: Arc<Mutex<Database>>,
    context: String,
    feed: ChangeFeed,
    wake: Option<DebounceHandle>,
    interval: Duration,
    mut cursor: i64,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut polls = 0u64;

    loop {
        ticker.tick().await;
        polls += 1;

        let batches = {
            let db = db.lock().await;
            let log = LibSqlEventLog::new(db.connection());
            if polls % PRUNE_EVERY == 0 {
                let cutoff = unix_millis_now() - i64::try_from(RETENTION.as_millis()).unwrap_or(0);
                if let Err(error) = log.prune_before(cutoff).await {
                    tracing::warn!(%context, "Pruning the event log failed: {error}");
                }
            }
            log.since(cursor, READ_LIMIT).await
        };
        let batches = match batches {
            Ok(batches) => batches,
            Err(error) => {
                tracing::warn!(%context, "Reading the event log failed: {error}");
                continue;
            }
        };

        for batch in batches {
            cursor = batch.seq;
            if batch.context == context {
                continue;
            }
            let local = batch.has_local_writes();
            tracing::trace!(
                %context,
                from = %batch.context,
                seq = batch.seq,
                events = batch.events.len(),
                "Relaying sibling commit"
            );
            feed.publish(batch.events);
            if local {
                if let Some(wake) = &wake {
                    wake.touch();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChangeCapture, Debouncer};
    use crate::db::Schema;
    use crate::events::StoreEventKind;
    use crate::models::Document;
    use crate::sync::SyncTrigger;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    async fn open(path: &std::path::Path) -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(Database::open(path, Schema::Replica).await.unwrap()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sibling_commits_reach_the_local_feed() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("replica.db");
        let writer_db = open(&path).await;
        let reader_db = open(&path).await;

        let writer = ChangeCapture::new(writer_db, ChangeFeed::default()).with_origin_window("ctx-1");
        writer.create("notes", "before", Document::new()).await.unwrap();

        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe();
        let trigger = SyncTrigger::new();
        let debouncer = Debouncer::spawn(Duration::from_millis(10), 8, trigger.clone());
        let relay = SiblingRelay::start(
            reader_db,
            "ctx-2",
            feed,
            Some(debouncer.handle()),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        writer.create("notes", "n1", Document::new()).await.unwrap();

        // Only commits after the relay started are replayed.
        let batch = tokio::time::timeout(Duration::from_secs(2), sub.next_batch())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "n1");
        assert_eq!(batch[0].kind, StoreEventKind::Created);
        tokio::time::timeout(Duration::from_secs(2), trigger.requested())
            .await
            .unwrap();
        relay.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_own_commits_are_not_replayed() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("replica.db");
        let db = open(&path).await;

        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe();
        let writer = ChangeCapture::new(db.clone(), feed.clone()).with_origin_window("ctx-1");
        let relay = SiblingRelay::start(db, "ctx-1", feed, None, Duration::from_millis(10))
            .await
            .unwrap();

        writer.create("notes", "n1", Document::new()).await.unwrap();
        assert_eq!(sub.next_batch().await.unwrap()[0].key, "n1");
        let again = tokio::time::timeout(Duration::from_millis(200), sub.next_batch()).await;
        assert!(again.is_err());
        relay.stop();
    }
}
