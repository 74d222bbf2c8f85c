//! loam-core - Local-first change-log replication engine
//!
//! Each replica keeps a local store and an outbox of captured changes. A
//! leader context per replica exchanges changes with a server that assigns
//! revisions per tenant and rebuilds authoritative entity snapshots. The
//! server side lives here too, so the whole engine runs in-process in tests.

pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod replica;
pub mod server;
pub mod sync;
pub mod util;

pub use capture::ChangeCapture;
pub use config::{ConfigError, ReplicaConfig};
pub use error::{Error, InvariantViolation, Result};
pub use events::{ChangeFeed, ChangeSubscription, StoreEvent, StoreEventKind};
pub use models::{ChangeId, ChangeOp, ChangeRecord, Document, ReplicaId, SyncState};
pub use replica::Replica;
pub use server::SyncHub;
