//! Server side of the sync protocol: per-tenant change log, revision
//! assignment, snapshots, pulls and compaction.

mod hub;
mod ingest;
mod log;

pub use hub::{SyncHub, DEFAULT_MAX_BATCH};
pub use ingest::{compact, ingest, pull, CompactionReport, IngestReport};
pub use log::ChangeLog;
