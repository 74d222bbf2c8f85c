//! Entity snapshot model

use serde::{Deserialize, Serialize};

use super::Document;

/// Materialized state of one entity, derived from its change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub table: String,
    pub doc_id: String,
    /// Current full document (kept after deletion)
    pub doc: Document,
    /// Tombstone flag
    pub is_deleted: bool,
    /// Highest change timestamp folded in (Unix ms)
    pub last_timestamp: i64,
    /// Highest revision folded in (0 until a committed change is seen)
    pub revision: u64,
}

impl EntitySnapshot {
    /// Canonical JSON encoding, used to compare snapshots across replicas.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal documents encode equally.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
