//! Command hub shared by every server-side connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::db::{Database, Schema};
use crate::error::{Error, Result};
use crate::models::{ChangeRecord, ChangesPull, EntitySnapshot, ReplicaId};
use crate::sync::protocol::{ApplyNewChangesResponse, Command, CommandResponse};

use super::ingest::{self, CompactionReport};
use super::log::ChangeLog;

/// Default cap on changes per `applyNewChanges` batch.
pub const DEFAULT_MAX_BATCH: usize = 1_000;

const REVISION_CHANNEL_CAPACITY: usize = 64;

/// Owns the server database and fans new revisions out to subscribers.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    db: Mutex<Database>,
    tenant_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<u64>>>,
    max_batch: usize,
}

impl SyncHub {
    pub fn new(db: Database) -> Result<Self> {
        if db.schema() != Schema::Server {
            return Err(Error::InvalidInput(
                "sync hub needs a server database".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(HubInner {
                db: Mutex::new(db),
                tenant_locks: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                max_batch: DEFAULT_MAX_BATCH,
            }),
        })
    }

    /// Hub over a fresh in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::new(Database::open_in_memory(Schema::Server).await?)
    }

    /// Change the per-batch cap. Only valid before the hub is shared.
    #[must_use]
    pub fn with_max_batch(self, max_batch: usize) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.max_batch = max_batch.max(1);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    pub fn max_batch(&self) -> usize {
        self.inner.max_batch
    }

    /// Execute one protocol command for `tenant`.
    pub async fn handle(&self, tenant: &str, command: Command) -> Result<CommandResponse> {
        match command {
            Command::ApplyNewChanges {
                replica_id,
                changes,
                base_revision,
            } => self
                .apply_new_changes(tenant, replica_id, changes, base_revision)
                .await
                .map(CommandResponse::Applied),
            Command::GetChanges {
                last_received_remote_revision,
                replica_id,
            } => self
                .get_changes(tenant, last_received_remote_revision, replica_id)
                .await
                .map(CommandResponse::Pull),
        }
    }

    /// Ingest a batch; answers `locked` instead of waiting when another batch
    /// for the tenant is in progress.
    pub async fn apply_new_changes(
        &self,
        tenant: &str,
        replica_id: ReplicaId,
        changes: Vec<ChangeRecord>,
        base_revision: Option<u64>,
    ) -> Result<ApplyNewChangesResponse> {
        validate_tenant(tenant)?;
        if changes.len() > self.inner.max_batch {
            tracing::debug!(
                tenant,
                replica = %replica_id,
                size = changes.len(),
                limit = self.inner.max_batch,
                "Batch over the limit, asking for smaller ones"
            );
            return Ok(ApplyNewChangesResponse::BatchTooLarge {
                max_batch: self.inner.max_batch,
            });
        }

        let lock = self.tenant_lock(tenant).await;
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(tenant, replica = %replica_id, "Tenant busy, answering locked");
            return Ok(ApplyNewChangesResponse::Locked);
        };

        let report = {
            let db = self.inner.db.lock().await;
            ingest::ingest(db.connection(), tenant, replica_id, changes, base_revision).await?
        };

        let response = report
            .response
            .ok_or_else(|| Error::Database("ingest finished without a response".to_string()))?;
        if let ApplyNewChangesResponse::Success { new_revision } = response {
            self.publish(tenant, new_revision).await;
        }
        Ok(response)
    }

    pub async fn get_changes(
        &self,
        tenant: &str,
        since: Option<u64>,
        replica_id: Option<ReplicaId>,
    ) -> Result<ChangesPull> {
        validate_tenant(tenant)?;
        let db = self.inner.db.lock().await;
        ingest::pull(db.connection(), tenant, since, replica_id).await
    }

    /// Authoritative snapshot of one entity
    pub async fn snapshot(&self, tenant: &str, table: &str, id: &str) -> Result<Option<EntitySnapshot>> {
        validate_tenant(tenant)?;
        let db = self.inner.db.lock().await;
        ChangeLog::new(db.connection(), tenant).snapshot(table, id).await
    }

    pub async fn current_revision(&self, tenant: &str) -> Result<u64> {
        validate_tenant(tenant)?;
        let db = self.inner.db.lock().await;
        ChangeLog::new(db.connection(), tenant).current_revision().await
    }

    /// Drop history of deleted entities that every replica has pulled past.
    ///
    /// Waits for in-flight ingestion of the tenant instead of answering locked.
    pub async fn compact(&self, tenant: &str) -> Result<CompactionReport> {
        validate_tenant(tenant)?;
        let lock = self.tenant_lock(tenant).await;
        let _guard = lock.lock().await;
        let db = self.inner.db.lock().await;
        ingest::compact(db.connection(), tenant).await
    }

    /// Revisions committed for `tenant` from now on
    pub async fn subscribe(&self, tenant: &str) -> broadcast::Receiver<u64> {
        let mut channels = self.inner.channels.lock().await;
        channels
            .entry(tenant.to_string())
            .or_insert_with(|| broadcast::channel(REVISION_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn publish(&self, tenant: &str, revision: u64) {
        let channels = self.inner.channels.lock().await;
        if let Some(sender) = channels.get(tenant) {
            // No subscribers is fine.
            let _ = sender.send(revision);
        }
    }

    async fn tenant_lock(&self, tenant: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.tenant_locks.lock().await;
        locks.entry(tenant.to_string()).or_default().clone()
    }
}

fn validate_tenant(tenant: &str) -> Result<()> {
    let valid = !tenant.is_empty()
        && tenant.len() <= 128
        && tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid tenant: {tenant:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{document, Document};
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_roundtrip_and_push() {
        let hub = SyncHub::in_memory().await.unwrap();
        let mut revisions = hub.subscribe("acme").await;

        let response = hub
            .handle(
                "acme",
                Command::ApplyNewChanges {
                    replica_id: ReplicaId::new(),
                    changes: vec![ChangeRecord::create(
                        "notes",
                        "n1",
                        document(json!({"title": "A"})),
                    )],
                    base_revision: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            CommandResponse::Applied(ApplyNewChangesResponse::Success { new_revision: 1 })
        );
        assert_eq!(revisions.recv().await.unwrap(), 1);

        let CommandResponse::Pull(pull) = hub
            .handle(
                "acme",
                Command::GetChanges {
                    last_received_remote_revision: None,
                    replica_id: None,
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected a pull");
        };
        assert_eq!(pull.server_revision, 1);
        assert_eq!(
            hub.snapshot("acme", "notes", "n1").await.unwrap().unwrap().doc["title"],
            "A"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_busy_tenant_answers_locked() {
        let hub = SyncHub::in_memory().await.unwrap();
        let lock = hub.tenant_lock("acme").await;
        let _held = lock.lock().await;

        let response = hub
            .apply_new_changes(
                "acme",
                ReplicaId::new(),
                vec![ChangeRecord::create("notes", "n1", Document::new())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(response, ApplyNewChangesResponse::Locked);

        // Other tenants are unaffected
        let other = hub
            .apply_new_changes(
                "globex",
                ReplicaId::new(),
                vec![ChangeRecord::create("notes", "n1", Document::new())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(other, ApplyNewChangesResponse::Success { new_revision: 1 });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_batch_advertises_limit_and_bad_tenant_fails() {
        let hub = SyncHub::in_memory().await.unwrap().with_max_batch(1);
        let changes = vec![
            ChangeRecord::create("notes", "a", Document::new()),
            ChangeRecord::create("notes", "b", Document::new()),
        ];
        assert_eq!(
            hub.apply_new_changes("acme", ReplicaId::new(), changes, None)
                .await
                .unwrap(),
            ApplyNewChangesResponse::BatchTooLarge { max_batch: 1 }
        );
        assert_eq!(hub.current_revision("acme").await.unwrap(), 0);
        assert!(matches!(
            hub.get_changes("../etc", None, None).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
