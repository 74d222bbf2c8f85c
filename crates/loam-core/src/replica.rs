//! One execution context's handle on a replica.
//!
//! Several contexts may open the same replica database. Each gets its own
//! capture handle and debouncer and joins the leader election; only the
//! leader's synchronizer talks to the server. Every context keeps reading
//! and writing the local store while offline or not leading, and sees the
//! commits of its siblings on its change feed through a [`SiblingRelay`].

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capture::{ChangeCapture, Debouncer, SiblingRelay};
use crate::config::ReplicaConfig;
use crate::db::{
    Database, LibSqlOutbox, LibSqlQuarantineRepository, LibSqlSyncStatusRepository, Outbox,
    OutboxEntry, QuarantineRepository, QuarantinedEntity, Schema, SyncStatusRepository,
    Transaction,
};
use crate::error::{Error, Result};
use crate::events::{ChangeFeed, ChangeSubscription};
use crate::models::{SyncState, SyncStatus};
use crate::sync::{Connector, LeaderElector, SyncTrigger, Synchronizer};

pub struct Replica {
    db: Arc<Mutex<Database>>,
    feed: ChangeFeed,
    capture: ChangeCapture,
    config: ReplicaConfig,
    context: String,
    trigger: SyncTrigger,
    state: watch::Receiver<SyncState>,
    debouncer: Option<Debouncer>,
    relay: Option<SiblingRelay>,
    leader: Option<LeaderElector>,
    sync_task: Option<JoinHandle<()>>,
}

impl Replica {
    /// Open a context that syncs through `connector` whenever it is leader.
    pub async fn open<C: Connector>(
        db: Database,
        config: ReplicaConfig,
        connector: C,
    ) -> Result<Self> {
        let mut replica = Self::open_offline(db, config).await?;
        replica.start_sync(connector);
        Ok(replica)
    }

    /// Open a database file and sync through `connector`.
    pub async fn open_path<C: Connector>(
        path: impl AsRef<Path>,
        config: ReplicaConfig,
        connector: C,
    ) -> Result<Self> {
        let db = Database::open(path, Schema::Replica).await?;
        Self::open(db, config, connector).await
    }

    /// Open a context that never connects to a server.
    pub async fn open_offline(db: Database, config: ReplicaConfig) -> Result<Self> {
        if db.schema() != Schema::Replica {
            return Err(Error::InvalidInput(
                "replica needs a replica database".to_string(),
            ));
        }
        let status = LibSqlSyncStatusRepository::new(db.connection())
            .load_or_init()
            .await?;

        let db = Arc::new(Mutex::new(db));
        let context = Uuid::new_v4().to_string();
        let feed = ChangeFeed::default();
        let trigger = SyncTrigger::new();
        let debouncer = Debouncer::spawn(config.debounce, config.debounce_queue, trigger.clone());
        let capture = ChangeCapture::new(db.clone(), feed.clone())
            .with_origin_window(context.clone())
            .with_debouncer(debouncer.handle());
        let relay = SiblingRelay::start(
            db.clone(),
            context.clone(),
            feed.clone(),
            Some(debouncer.handle()),
            config.relay_interval,
        )
        .await?;
        let (_, state) = watch::channel(SyncState::Offline);

        tracing::info!(replica = %status.replica_id, %context, "Opened replica");
        Ok(Self {
            db,
            feed,
            capture,
            config,
            context,
            trigger,
            state,
            debouncer: Some(debouncer),
            relay: Some(relay),
            leader: None,
            sync_task: None,
        })
    }

    fn start_sync<C: Connector>(&mut self, connector: C) {
        let leader = LeaderElector::start(
            self.db.clone(),
            self.context.clone(),
            self.config.leader_lease,
        );
        let synchronizer = Synchronizer::new(
            self.db.clone(),
            self.feed.clone(),
            connector,
            self.config.clone(),
            self.trigger.clone(),
        )
        .with_context(self.context.clone());
        self.state = synchronizer.state();
        self.sync_task = Some(tokio::spawn(synchronizer.run(leader.subscribe())));
        self.leader = Some(leader);
    }

    /// Write API for this context
    pub const fn capture(&self) -> &ChangeCapture {
        &self.capture
    }

    /// Committed local-store changes, from this context and its siblings
    pub fn subscribe(&self) -> ChangeSubscription {
        self.feed.subscribe()
    }

    /// Identifier of this execution context (also its `originWindow`)
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn sync_state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Sync state changes, starting with the current value
    pub fn watch_sync_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.as_ref().is_some_and(LeaderElector::is_leader)
    }

    /// Ask the leader's synchronizer for a step now. No-op when not leading.
    pub fn request_sync(&self) {
        self.trigger.request();
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let db = self.db.lock().await;
        LibSqlSyncStatusRepository::new(db.connection())
            .load_or_init()
            .await
    }

    /// Changes not yet acknowledged by the server, in capture order
    pub async fn outbox(&self) -> Result<Vec<OutboxEntry>> {
        let db = self.db.lock().await;
        LibSqlOutbox::new(db.connection()).list().await
    }

    pub async fn quarantined(&self) -> Result<Vec<QuarantinedEntity>> {
        let db = self.db.lock().await;
        LibSqlQuarantineRepository::new(db.connection()).list().await
    }

    /// Put a quarantined entity back under automatic reconciliation.
    pub async fn release(&self, table: &str, id: &str) -> Result<bool> {
        let released = {
            let db = self.db.lock().await;
            LibSqlQuarantineRepository::new(db.connection())
                .release(table, id)
                .await?
        };
        if released {
            tracing::info!(table, id, "Released quarantined entity");
            self.trigger.request();
        }
        Ok(released)
    }

    /// Stop syncing and hand the lease to another context.
    ///
    /// An in-flight step is dropped, not completed; the next leader resumes
    /// from the persisted sync status.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(task) = self.sync_task.take() {
            task.abort();
            // Only the cancellation error is expected here.
            let _ = task.await;
            let db = self.db.lock().await;
            Transaction::rollback_abandoned(db.connection()).await?;
        }
        if let Some(relay) = self.relay.take() {
            relay.stop();
        }
        if let Some(debouncer) = self.debouncer.take() {
            debouncer.stop();
        }
        if let Some(leader) = self.leader.take() {
            leader.resign().await?;
        }
        tracing::info!(context = %self.context, "Replica context shut down");
        Ok(())
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
    }
}
