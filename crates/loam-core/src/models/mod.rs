//! Data models for Loam

mod change;
mod pull;
mod snapshot;
mod sync_status;

pub use change::{document, ChangeId, ChangeOp, ChangeRecord, Document, ReplicaId};
pub use pull::ChangesPull;
pub use snapshot::EntitySnapshot;
pub use sync_status::{SyncState, SyncStatus};
