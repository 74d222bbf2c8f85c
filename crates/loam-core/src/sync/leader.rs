//! Leader election among execution contexts sharing one replica database.
//!
//! Each context runs a heartbeat that tries to take or renew a lease row in the
//! shared database every third of the lease length. Whoever holds an unexpired
//! lease is leader; if it stops renewing (crash, shutdown, hang) the lease
//! lapses and the next heartbeat of another context takes over.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::db::{Database, LeaseRepository, LibSqlLeaseRepository};
use crate::error::Result;
use crate::util::unix_millis_now;

/// Heartbeat-driven membership in a replica's leader election.
pub struct LeaderElector {
    db: Arc<Mutex<Database>>,
    holder: String,
    leadership: watch::Receiver<bool>,
    heartbeat: JoinHandle<()>,
}

impl LeaderElector {
    /// Join the election as `holder` (unique per execution context).
    pub fn start(db: Arc<Mutex<Database>>, holder: impl Into<String>, lease: Duration) -> Self {
        let holder = holder.into();
        let (sender, leadership) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat(db.clone(), holder.clone(), lease, sender));
        Self {
            db,
            holder,
            leadership,
            heartbeat,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    /// Leadership changes, starting with the current value
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leadership.clone()
    }

    /// Wait until this context is leader
    pub async fn wait_for_leadership(&self) {
        let mut leadership = self.subscribe();
        // The sender lives as long as the heartbeat; if it is gone we never lead.
        let _ = leadership.wait_for(|leader| *leader).await;
    }

    /// Stop heartbeating and hand the lease back so another context can
    /// take over without waiting for it to expire.
    pub async fn resign(self) -> Result<()> {
        self.heartbeat.abort();
        let db = self.db.lock().await;
        let released = LibSqlLeaseRepository::new(db.connection())
            .release(&self.holder)
            .await?;
        if released {
            tracing::info!(holder = %self.holder, "Resigned leadership");
        }
        Ok(())
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn heartbeat(
    db: Arc<Mutex<Database>>,
    holder: String,
    lease: Duration,
    leadership: watch::Sender<bool>,
) {
    let ttl_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    let mut ticker = tokio::time::interval((lease / 3).max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = unix_millis_now();
        let acquired = {
            let db = db.lock().await;
            LibSqlLeaseRepository::new(db.connection())
                .try_acquire(&holder, now, ttl_ms)
                .await
        };

        let leader = match acquired {
            Ok(leader) => leader,
            Err(error) => {
                tracing::warn!(%holder, "Lease heartbeat failed: {error}");
                false
            }
        };

        leadership.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            if leader {
                tracing::info!(%holder, "Became leader");
            } else {
                tracing::info!(%holder, "Lost leadership");
            }
            *current = leader;
            true
        });
    }
}
