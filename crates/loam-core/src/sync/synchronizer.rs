//! Client synchronizer: the "apply received pull, then send my outbox" step
//! and the leader-only loop that drives it.
//!
//! At most one step runs at a time per synchronizer. Triggers that arrive
//! during a step (local writes, server pushes, reconnects) collapse into one
//! follow-up step. All progress is persisted in `sync_status` and the outbox,
//! so a step dropped halfway is simply redone after the next start.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::capture;
use crate::config::ReplicaConfig;
use crate::db::{
    Database, EventLog, LibSqlEventLog, LibSqlOutbox, LibSqlQuarantineRepository,
    LibSqlSyncStatusRepository, Outbox, QuarantineRepository, SyncStatusRepository, Transaction,
    TransactionMode,
};
use crate::error::{Error, Result};
use crate::events::{ChangeFeed, StoreEvent};
use crate::models::{ChangeRecord, ChangesPull, SyncState};

use super::coalesce::coalesce;
use super::conflict::resolve;
use super::executer::CommandExecuter;
use super::protocol::{ApplyNewChangesResponse, Command, CommandResponse};
use super::transport::Connector;
use super::trigger::SyncTrigger;

type EntityKey = (String, String);

/// What applying one pull did to the local store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub server_revision: u64,
    /// Changes in the pull
    pub pulled: usize,
    /// This replica's own changes echoed back
    pub echoes: usize,
    /// Rows touched in the local store
    pub applied: usize,
    /// Rebased local changes re-recorded in the outbox
    pub conflicted: usize,
    /// Outbox entries dropped in favour of a remote delete
    pub discarded: usize,
    pub quarantined: usize,
}

/// Result of offering the outbox to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Nothing to send
    Idle,
    Sent {
        sent: usize,
        new_revision: u64,
        /// More changes are waiting beyond the batch cap
        more_pending: bool,
    },
    /// The server is ahead; pull before resubmitting
    Stale,
    /// Another batch is being ingested; retry later
    Locked,
    /// The server refused the batch size; the cap is now `limit`
    TooLarge { limit: usize },
}

/// Summary of one synchronization step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub pulled: usize,
    pub applied: usize,
    pub conflicted: usize,
    pub discarded: usize,
    pub quarantined: usize,
    pub sent: usize,
    pub server_revision: Option<u64>,
    pub more_pending: bool,
}

impl StepReport {
    fn absorb(&mut self, pull: &PullReport) {
        self.pulled += pull.pulled;
        self.applied += pull.applied;
        self.conflicted += pull.conflicted;
        self.discarded += pull.discarded;
        self.quarantined += pull.quarantined;
        self.server_revision = Some(pull.server_revision);
    }
}

enum Disconnect {
    Transport,
    Leadership,
    Shutdown,
}

/// Owns the server side of one replica while its context is leader.
pub struct Synchronizer<C: Connector> {
    db: Arc<Mutex<Database>>,
    feed: ChangeFeed,
    connector: C,
    config: ReplicaConfig,
    trigger: SyncTrigger,
    state: watch::Sender<SyncState>,
    /// Batch cap, lowered when the server refuses a batch as too large
    batch_limit: AtomicUsize,
    /// Execution context recorded with pulled changes for sibling contexts
    context: Option<String>,
}

impl<C: Connector> Synchronizer<C> {
    pub fn new(
        db: Arc<Mutex<Database>>,
        feed: ChangeFeed,
        connector: C,
        config: ReplicaConfig,
        trigger: SyncTrigger,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Offline);
        let batch_limit = AtomicUsize::new(config.max_batch.max(1));
        Self {
            db,
            feed,
            connector,
            config,
            trigger,
            state,
            batch_limit,
            context: None,
        }
    }

    /// Record applied pulls in the shared event log under `context`.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Largest batch the next push will send
    pub fn batch_limit(&self) -> usize {
        self.batch_limit.load(Ordering::Relaxed)
    }

    /// Sync state changes, starting with the current value
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub const fn trigger(&self) -> &SyncTrigger {
        &self.trigger
    }

    /// Open a connection and start a command executer on it
    pub async fn connect(&self) -> Result<CommandExecuter> {
        let connection = self.connector.connect().await?;
        Ok(CommandExecuter::start(
            connection,
            self.config.retry_policy(),
            self.trigger.clone(),
        ))
    }

    /// One step: pull and apply, then push the outbox.
    ///
    /// `stale_changes` loops back to the pull, `locked` backs off first; both
    /// are bounded by `max_send_attempts`, after which the outbox is left for
    /// the next step.
    pub async fn step(&self, executer: &CommandExecuter) -> Result<StepReport> {
        let mut report = StepReport::default();
        let policy = self.config.retry_policy();
        let attempts = self.config.max_send_attempts.max(1);

        for attempt in 1..=attempts {
            let pull = self.pull(executer).await?;
            let applied = self.apply_pull(pull).await?;
            report.absorb(&applied);

            match self.push(executer).await? {
                PushOutcome::Idle => return Ok(report),
                PushOutcome::Sent {
                    sent,
                    new_revision,
                    more_pending,
                } => {
                    report.sent += sent;
                    report.server_revision = Some(new_revision);
                    report.more_pending = more_pending;
                    return Ok(report);
                }
                PushOutcome::Stale => {
                    tracing::debug!(attempt, "Server is ahead, pulling before resubmitting");
                }
                PushOutcome::TooLarge { limit } => {
                    tracing::debug!(attempt, limit, "Resubmitting in smaller batches");
                    report.more_pending = true;
                }
                PushOutcome::Locked => {
                    let delay = policy.backoff(attempt);
                    tracing::debug!(attempt, ?delay, "Server busy, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        tracing::warn!(attempts, "Outbox not accepted this step, leaving it for the next one");
        Ok(report)
    }

    /// Ask the server for everything after the last received revision.
    pub async fn pull(&self, executer: &CommandExecuter) -> Result<ChangesPull> {
        let status = {
            let db = self.db.lock().await;
            LibSqlSyncStatusRepository::new(db.connection())
                .load_or_init()
                .await?
        };
        let response = executer
            .execute(Command::GetChanges {
                last_received_remote_revision: status.last_received_remote_revision,
                replica_id: Some(status.replica_id),
            })
            .await?;
        match response {
            CommandResponse::Pull(pull) => Ok(pull),
            CommandResponse::Applied(_) => Err(Error::Protocol(
                "getChanges answered with an apply status".to_string(),
            )),
        }
    }

    /// Reconcile a pull with the outbox and apply it, all in one local
    /// transaction together with the new sync position.
    pub async fn apply_pull(&self, pull: ChangesPull) -> Result<PullReport> {
        let ChangesPull {
            pull_id,
            server_revision,
            changes,
        } = pull;
        let db = self.db.lock().await;
        let conn = db.connection();

        let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
        let result = async {
            let status_repo = LibSqlSyncStatusRepository::new(conn);
            let outbox = LibSqlOutbox::new(conn);
            let quarantine = LibSqlQuarantineRepository::new(conn);

            let mut status = status_repo.load_or_init().await?;
            let mut pending = outbox.list().await?;
            let quarantined: HashSet<EntityKey> = quarantine
                .list()
                .await?
                .into_iter()
                .map(|entity| (entity.table, entity.id))
                .collect();

            let mut report = PullReport {
                server_revision,
                pulled: changes.len(),
                ..PullReport::default()
            };
            let mut remote = Vec::new();
            let mut acknowledged = Vec::new();

            for mut change in changes {
                let already_applied = matches!(
                    (change.revision, status.last_applied_remote_revision),
                    (Some(revision), Some(applied)) if revision <= applied
                );
                if already_applied {
                    continue;
                }

                if change.source_replica == Some(status.replica_id) {
                    report.echoes += 1;
                    // An echo still in the outbox means its acknowledgement was lost.
                    if let Some(seq) = pending
                        .iter()
                        .find(|entry| entry.change.id == change.id)
                        .map(|entry| entry.seq)
                    {
                        let (cleared, kept): (Vec<_>, Vec<_>) =
                            pending.into_iter().partition(|entry| {
                                entry.seq <= seq && entry.change.entity() == change.entity()
                            });
                        tracing::debug!(
                            table = %change.table,
                            key = %change.key,
                            cleared = cleared.len(),
                            "Own change came back unacknowledged, clearing outbox"
                        );
                        acknowledged.extend(cleared.into_iter().map(|entry| entry.change.id));
                        pending = kept;
                    }
                    continue;
                }

                if quarantined.contains(&(change.table.clone(), change.key.clone())) {
                    continue;
                }
                change.originates_from_remote = true;
                remote.push(change);
            }
            outbox.remove_ids(&acknowledged).await?;

            let local: Vec<ChangeRecord> = pending
                .into_iter()
                .map(|entry| entry.change)
                .filter(|change| {
                    !quarantined.contains(&(change.table.clone(), change.key.clone()))
                })
                .collect();
            let resolution = resolve(&local, &remote);

            let mut violations = resolution.violations;
            let server = capture::apply_changes(conn, &resolution.not_conflicted_server_changes).await?;
            let rebased = capture::apply_changes(conn, &resolution.conflicted_changes).await?;
            violations.extend(server.violations);
            for violation in &violations {
                let (table, key) = violation.entity();
                tracing::error!(table, key, %violation, "Quarantining entity");
                quarantine.quarantine(violation).await?;
            }
            outbox.remove_ids(&resolution.discarded_local_changes).await?;

            let revision = status
                .last_received_remote_revision
                .map_or(server_revision, |current| current.max(server_revision));
            status.last_received_remote_revision = Some(revision);
            status.last_applied_remote_revision = Some(revision);
            status_repo.save(&status).await?;

            report.applied = server.events.len() + rebased.events.len();
            report.conflicted = resolution.conflicted_changes.len();
            report.discarded = resolution.discarded_local_changes.len();
            report.quarantined = violations.len();

            let mut events: Vec<StoreEvent> = server.events;
            events.extend(rebased.events);
            if let Some(context) = &self.context {
                LibSqlEventLog::new(conn).append(context, &events).await?;
            }
            Ok((report, events))
        }
        .await;
        let (report, events) = tx.finish(result).await?;
        drop(db);

        if report.pulled > 0 {
            tracing::debug!(
                %pull_id,
                revision = report.server_revision,
                pulled = report.pulled,
                applied = report.applied,
                conflicted = report.conflicted,
                "Applied pull"
            );
        }
        self.feed.publish(events);
        Ok(report)
    }

    /// Offer the coalesced outbox to the server as one batch.
    ///
    /// Outbox rows are removed only once the server acknowledged them; rows
    /// captured while the batch is in flight stay.
    pub async fn push(&self, executer: &CommandExecuter) -> Result<PushOutcome> {
        let (status, batch, acknowledged, more_pending) = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let status = LibSqlSyncStatusRepository::new(conn).load_or_init().await?;
            let quarantined: HashSet<EntityKey> = LibSqlQuarantineRepository::new(conn)
                .list()
                .await?
                .into_iter()
                .map(|entity| (entity.table, entity.id))
                .collect();
            let outbox = LibSqlOutbox::new(conn);
            let entries: Vec<ChangeRecord> = outbox
                .list()
                .await?
                .into_iter()
                .map(|entry| entry.change)
                .filter(|change| {
                    !quarantined.contains(&(change.table.clone(), change.key.clone()))
                })
                .collect();
            if entries.is_empty() {
                return Ok(PushOutcome::Idle);
            }

            let mut batch = coalesce(entries.clone());
            let limit = self.batch_limit();
            let remainder: HashSet<EntityKey> = if batch.len() > limit {
                batch
                    .split_off(limit)
                    .into_iter()
                    .map(|change| (change.table, change.key))
                    .collect()
            } else {
                HashSet::new()
            };
            let acknowledged: Vec<_> = entries
                .iter()
                .filter(|change| !remainder.contains(&(change.table.clone(), change.key.clone())))
                .map(|change| change.id)
                .collect();

            if batch.is_empty() {
                // Everything cancelled out while offline.
                outbox.remove_ids(&acknowledged).await?;
                return Ok(PushOutcome::Idle);
            }
            (status, batch, acknowledged, !remainder.is_empty())
        };

        let sent = batch.len();
        let response = executer
            .execute(Command::ApplyNewChanges {
                replica_id: status.replica_id,
                changes: batch,
                base_revision: status.last_received_remote_revision,
            })
            .await?;
        let CommandResponse::Applied(response) = response else {
            return Err(Error::Protocol(
                "applyNewChanges answered with a pull".to_string(),
            ));
        };

        match response {
            ApplyNewChangesResponse::Success { new_revision } => {
                let db = self.db.lock().await;
                let conn = db.connection();
                let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
                let result = async {
                    LibSqlOutbox::new(conn).remove_ids(&acknowledged).await?;
                    let status_repo = LibSqlSyncStatusRepository::new(conn);
                    let mut status = status_repo.load_or_init().await?;
                    status.last_received_remote_revision = Some(new_revision);
                    status.last_applied_remote_revision = Some(new_revision);
                    status_repo.save(&status).await
                }
                .await;
                tx.finish(result).await?;

                tracing::info!(sent, revision = new_revision, "Outbox acknowledged");
                Ok(PushOutcome::Sent {
                    sent,
                    new_revision,
                    more_pending,
                })
            }
            ApplyNewChangesResponse::StaleChanges => Ok(PushOutcome::Stale),
            ApplyNewChangesResponse::Locked => Ok(PushOutcome::Locked),
            ApplyNewChangesResponse::BatchTooLarge { max_batch } => {
                // Trust the advertised cap only when it actually shrinks the batch.
                let limit = if (1..sent).contains(&max_batch) {
                    max_batch
                } else {
                    (sent / 2).max(1)
                };
                self.batch_limit.fetch_min(limit, Ordering::Relaxed);
                tracing::warn!(sent, limit, "Server refused the batch size");
                Ok(PushOutcome::TooLarge { limit })
            }
        }
    }

    /// Drive steps for as long as this context is leader.
    ///
    /// Returns when the leadership channel closes (the elector is gone).
    pub async fn run(self, mut leadership: watch::Receiver<bool>) {
        let policy = self.config.retry_policy();
        let mut failures = 0u32;

        loop {
            if leadership.wait_for(|leader| *leader).await.is_err() {
                break;
            }

            let executer = match self.connect().await {
                Ok(executer) => executer,
                Err(error) => {
                    failures += 1;
                    let delay = policy.backoff(failures);
                    tracing::warn!(%error, attempt = failures, ?delay, "Connecting to server failed");
                    self.set_state(SyncState::Offline);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            tracing::info!("Connected to sync server");

            match self.serve(&executer, &mut leadership, &mut failures).await {
                Disconnect::Shutdown => break,
                Disconnect::Leadership => {
                    tracing::info!("Leadership lost, disconnecting");
                    self.set_state(SyncState::Offline);
                }
                Disconnect::Transport => {
                    failures += 1;
                    let delay = policy.backoff(failures);
                    tracing::warn!(attempt = failures, ?delay, "Connection lost, reconnecting");
                    self.set_state(SyncState::Offline);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.set_state(SyncState::Offline);
    }

    async fn serve(
        &self,
        executer: &CommandExecuter,
        leadership: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Disconnect {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and doubles as the reconnect step.
        poll.tick().await;
        self.trigger.request();

        loop {
            tokio::select! {
                () = self.trigger.requested() => {}
                _ = poll.tick() => {}
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return Disconnect::Shutdown;
                    }
                    if !*leadership.borrow_and_update() {
                        return Disconnect::Leadership;
                    }
                    continue;
                }
            }

            if !executer.is_connected() {
                return Disconnect::Transport;
            }

            self.set_state(SyncState::Syncing);
            match self.step(executer).await {
                Ok(report) => {
                    *failures = 0;
                    self.set_state(SyncState::Synced);
                    if report.more_pending {
                        self.trigger.request();
                    }
                }
                Err(error) if error.is_transport() => {
                    tracing::warn!(%error, "Sync step failed on the connection");
                    return Disconnect::Transport;
                }
                Err(error) => {
                    tracing::error!(%error, "Sync step failed");
                    self.set_state(SyncState::Error);
                }
            }
        }
    }

    fn set_state(&self, next: SyncState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                tracing::debug!(from = ?*state, to = ?next, "Sync state changed");
                *state = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChangeCapture;
    use crate::db::Schema;
    use crate::models::{document, Document};
    use crate::server::SyncHub;
    use crate::sync::MemoryConnector;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Client {
        db: Arc<Mutex<Database>>,
        capture: ChangeCapture,
        sync: Synchronizer<MemoryConnector>,
    }

    async fn client(hub: &SyncHub) -> Client {
        let db = Arc::new(Mutex::new(
            Database::open_in_memory(Schema::Replica).await.unwrap(),
        ));
        let feed = ChangeFeed::default();
        let capture = ChangeCapture::new(db.clone(), feed.clone());
        let sync = Synchronizer::new(
            db.clone(),
            feed,
            MemoryConnector::new(hub.clone(), "acme"),
            ReplicaConfig::default(),
            SyncTrigger::new(),
        );
        Client { db, capture, sync }
    }

    async fn outbox_len(db: &Arc<Mutex<Database>>) -> usize {
        let db = db.lock().await;
        LibSqlOutbox::new(db.connection()).count().await.unwrap()
    }

    async fn status(db: &Arc<Mutex<Database>>) -> crate::models::SyncStatus {
        let db = db.lock().await;
        LibSqlSyncStatusRepository::new(db.connection())
            .load_or_init()
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_step_pushes_outbox_and_peer_pulls_it() {
        let hub = SyncHub::in_memory().await.unwrap();
        let a = client(&hub).await;
        let b = client(&hub).await;

        a.capture
            .create("notes", "n1", document(json!({"title": "A"})))
            .await
            .unwrap();
        let executer = a.sync.connect().await.unwrap();
        let report = a.sync.step(&executer).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.server_revision, Some(1));
        assert_eq!(outbox_len(&a.db).await, 0);
        assert_eq!(status(&a.db).await.last_received_remote_revision, Some(1));

        let executer = b.sync.connect().await.unwrap();
        let report = b.sync.step(&executer).await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(
            b.capture.get("notes", "n1").await.unwrap().unwrap().doc["title"],
            "A"
        );
        // Pulled changes never feed back into the outbox
        assert_eq!(outbox_len(&b.db).await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_push_is_recovered_within_the_step() {
        let hub = SyncHub::in_memory().await.unwrap();
        let a = client(&hub).await;
        let b = client(&hub).await;
        let a_exec = a.sync.connect().await.unwrap();
        let b_exec = b.sync.connect().await.unwrap();

        // Both start from an empty server
        b.sync.step(&b_exec).await.unwrap();

        a.capture.create("notes", "a1", Document::new()).await.unwrap();
        a.sync.step(&a_exec).await.unwrap();

        b.capture.create("notes", "b1", Document::new()).await.unwrap();
        assert_eq!(b.sync.push(&b_exec).await.unwrap(), PushOutcome::Stale);

        let report = b.sync.step(&b_exec).await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(report.server_revision, Some(2));
        assert!(b.capture.get("notes", "a1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lost_acknowledgement_is_settled_by_the_echo() {
        let hub = SyncHub::in_memory().await.unwrap();
        let a = client(&hub).await;

        let change = a
            .capture
            .create("notes", "n1", document(json!({"title": "A"})))
            .await
            .unwrap();
        // The server took the batch but the replica never heard back.
        let replica_id = status(&a.db).await.replica_id;
        hub.apply_new_changes("acme", replica_id, vec![change], None)
            .await
            .unwrap();

        let executer = a.sync.connect().await.unwrap();
        let report = a.sync.step(&executer).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(outbox_len(&a.db).await, 0);
        assert_eq!(hub.current_revision("acme").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflicting_update_is_rebased_and_resent() {
        let hub = SyncHub::in_memory().await.unwrap();
        let a = client(&hub).await;
        let b = client(&hub).await;
        let a_exec = a.sync.connect().await.unwrap();
        let b_exec = b.sync.connect().await.unwrap();

        a.capture
            .create("notes", "n1", document(json!({"title": "A", "body": "x"})))
            .await
            .unwrap();
        a.sync.step(&a_exec).await.unwrap();
        b.sync.step(&b_exec).await.unwrap();

        b.capture
            .update("notes", "n1", document(json!({"title": "remote", "body": "y"})))
            .await
            .unwrap();
        b.sync.step(&b_exec).await.unwrap();

        a.capture
            .update("notes", "n1", document(json!({"title": "local"})))
            .await
            .unwrap();
        let report = a.sync.step(&a_exec).await.unwrap();
        assert_eq!(report.conflicted, 1);
        assert_eq!(report.sent, 1);

        let doc = a.capture.get("notes", "n1").await.unwrap().unwrap().doc;
        assert_eq!(doc, document(json!({"title": "local", "body": "y"})));

        b.sync.step(&b_exec).await.unwrap();
        let doc = b.capture.get("notes", "n1").await.unwrap().unwrap().doc;
        assert_eq!(doc, document(json!({"title": "local", "body": "y"})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_collision_quarantines_entity() {
        let hub = SyncHub::in_memory().await.unwrap();
        let a = client(&hub).await;
        let b = client(&hub).await;
        let a_exec = a.sync.connect().await.unwrap();

        a.capture.create("notes", "n1", Document::new()).await.unwrap();
        a.sync.step(&a_exec).await.unwrap();

        b.capture.create("notes", "n1", Document::new()).await.unwrap();
        b.capture.create("notes", "n2", Document::new()).await.unwrap();
        let b_exec = b.sync.connect().await.unwrap();
        let report = b.sync.step(&b_exec).await.unwrap();
        assert_eq!(report.quarantined, 1);
        // The untouched entity still goes out
        assert_eq!(report.sent, 1);

        let db = b.db.lock().await;
        assert!(LibSqlQuarantineRepository::new(db.connection())
            .is_quarantined("notes", "n1")
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batches_are_capped() {
        let hub = SyncHub::in_memory().await.unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_in_memory(Schema::Replica).await.unwrap(),
        ));
        let feed = ChangeFeed::default();
        let capture = ChangeCapture::new(db.clone(), feed.clone());
        let sync = Synchronizer::new(
            db.clone(),
            feed,
            MemoryConnector::new(hub.clone(), "acme"),
            ReplicaConfig::default().with_max_batch(2),
            SyncTrigger::new(),
        );
        for key in ["a", "b", "c"] {
            capture.create("notes", key, Document::new()).await.unwrap();
        }

        let executer = sync.connect().await.unwrap();
        let first = sync.step(&executer).await.unwrap();
        assert_eq!(first.sent, 2);
        assert!(first.more_pending);
        assert_eq!(outbox_len(&db).await, 1);

        let second = sync.step(&executer).await.unwrap();
        assert_eq!(second.sent, 1);
        assert!(!second.more_pending);
        assert_eq!(hub.current_revision("acme").await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batches_shrink_to_the_server_limit() {
        let hub = SyncHub::in_memory().await.unwrap().with_max_batch(2);
        let a = client(&hub).await;
        for key in ["a", "b", "c"] {
            a.capture.create("notes", key, Document::new()).await.unwrap();
        }

        let executer = a.sync.connect().await.unwrap();
        let first = a.sync.step(&executer).await.unwrap();
        assert_eq!(first.sent, 2);
        assert!(first.more_pending);
        assert_eq!(a.sync.batch_limit(), 2);

        let mut steps = 1;
        while hub.current_revision("acme").await.unwrap() < 3 {
            assert!(steps < 5, "outbox never drained");
            a.sync.step(&executer).await.unwrap();
            steps += 1;
        }
        assert_eq!(outbox_len(&a.db).await, 0);
    }
}
