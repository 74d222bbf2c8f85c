//! Database layer for Loam

mod connection;
mod event_log;
mod lease;
mod migrations;
mod outbox;
mod quarantine;
mod store;
mod sync_status;
mod transaction;

pub use connection::{Database, Schema};
pub use event_log::{EventLog, LibSqlEventLog, LoggedBatch};
pub use lease::{Lease, LeaseRepository, LibSqlLeaseRepository};
pub use outbox::{LibSqlOutbox, Outbox, OutboxEntry};
pub use quarantine::{LibSqlQuarantineRepository, QuarantineRepository, QuarantinedEntity};
pub use store::{LibSqlRecordStore, RecordStore, StoredRecord};
pub use sync_status::{LibSqlSyncStatusRepository, SyncStatusRepository};
pub use transaction::{Transaction, TransactionMode};
