//! Server-to-replica change batches

use serde::{Deserialize, Serialize};

use super::ChangeRecord;

/// All changes after a given revision, in revision order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesPull {
    pub pull_id: String,
    /// Highest revision included (the tenant's revision when the pull was cut)
    pub server_revision: u64,
    pub changes: Vec<ChangeRecord>,
}
