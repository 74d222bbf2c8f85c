//! Per-replica sync bookkeeping

use serde::{Deserialize, Serialize};

use super::ReplicaId;

/// Persisted sync position of one replica (a single row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub replica_id: ReplicaId,
    /// Highest server revision whose changes were applied to the local store
    pub last_applied_remote_revision: Option<u64>,
    /// Highest server revision received in a pull
    pub last_received_remote_revision: Option<u64>,
}

impl SyncStatus {
    #[must_use]
    pub const fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            last_applied_remote_revision: None,
            last_received_remote_revision: None,
        }
    }
}

/// Unified sync indicator shown by clients.
///
/// Mutations never wait on it: a replica in `Offline` or `Error` keeps
/// working against its local store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}
