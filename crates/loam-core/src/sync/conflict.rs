//! Conflict resolution between a replica's unacknowledged changes and a pull.
//!
//! Tie-breaks, per entity key present on both sides:
//!
//! | local  | remote | outcome                                                  |
//! |--------|--------|----------------------------------------------------------|
//! | update | update | client wins on overlapping scalar/nested keys; the rest  |
//! |        |        | of the remote update applies; arrays merge as sets       |
//! | update | delete | delete wins, pending local updates are discarded         |
//! | delete | update | remote update dropped                                    |
//! | delete | delete | remote delete applied (idempotent)                       |
//! | create | any    | invariant violation, entity quarantined                  |
//! | any    | create | invariant violation, entity quarantined                  |

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::error::InvariantViolation;
use crate::models::{ChangeId, ChangeOp, ChangeRecord, Document};

use super::coalesce::coalesce;

/// Outcome of resolving one pull against the outbox.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Resolution {
    /// Changes to apply locally *and* re-record in the outbox, so the server
    /// learns the client's winning values
    pub conflicted_changes: Vec<ChangeRecord>,
    /// Remote changes to apply silently
    pub not_conflicted_server_changes: Vec<ChangeRecord>,
    /// Outbox entries superseded by a remote delete
    pub discarded_local_changes: Vec<ChangeId>,
    /// Entities that broke an invariant; excluded from reconciliation
    pub violations: Vec<InvariantViolation>,
}

impl Resolution {
    fn extend(&mut self, other: Self) {
        self.conflicted_changes.extend(other.conflicted_changes);
        self.not_conflicted_server_changes
            .extend(other.not_conflicted_server_changes);
        self.discarded_local_changes
            .extend(other.discarded_local_changes);
        self.violations.extend(other.violations);
    }
}

/// Resolve a pull against pending local changes across all tables.
pub fn resolve(local: &[ChangeRecord], remote: &[ChangeRecord]) -> Resolution {
    let mut local_by_table: BTreeMap<&str, Vec<ChangeRecord>> = BTreeMap::new();
    for change in local {
        local_by_table
            .entry(change.table.as_str())
            .or_default()
            .push(change.clone());
    }
    let mut remote_by_table: BTreeMap<&str, Vec<ChangeRecord>> = BTreeMap::new();
    for change in remote {
        remote_by_table
            .entry(change.table.as_str())
            .or_default()
            .push(change.clone());
    }

    let mut resolution = Resolution::default();
    for (table, remote_changes) in remote_by_table {
        let local_changes = local_by_table.remove(table).unwrap_or_default();
        resolution.extend(resolve_table(table, &local_changes, &remote_changes));
    }
    resolution
}

/// Resolve the changes of a single table.
pub fn resolve_table(table: &str, local: &[ChangeRecord], remote: &[ChangeRecord]) -> Resolution {
    let mut local_ids: HashMap<&str, Vec<ChangeId>> = HashMap::new();
    for change in local.iter().filter(|change| change.table == table) {
        local_ids.entry(change.key.as_str()).or_default().push(change.id);
    }
    let mut pending: HashMap<String, ChangeRecord> = coalesce(
        local
            .iter()
            .filter(|change| change.table == table)
            .cloned()
            .collect(),
    )
    .into_iter()
    .map(|change| (change.key.clone(), change))
    .collect();

    let mut resolution = Resolution::default();
    let mut quarantined: HashSet<String> = HashSet::new();

    for remote_change in remote.iter().filter(|change| change.table == table) {
        let key = remote_change.key.as_str();
        if quarantined.contains(key) {
            continue;
        }

        let Some((local_id, local_op)) = pending
            .get(key)
            .map(|change| (change.id, change.op.clone()))
        else {
            resolution
                .not_conflicted_server_changes
                .push(remote_change.clone());
            continue;
        };

        match (&local_op, &remote_change.op) {
            (ChangeOp::Create { .. }, _) | (_, ChangeOp::Create { .. }) => {
                resolution
                    .not_conflicted_server_changes
                    .retain(|change| change.key != key);
                resolution
                    .conflicted_changes
                    .retain(|change| change.key != key);
                resolution.violations.push(InvariantViolation::CreateCollision {
                    table: table.to_string(),
                    key: key.to_string(),
                });
                quarantined.insert(key.to_string());
            }
            (
                ChangeOp::Update {
                    from: local_from,
                    to: local_to,
                },
                ChangeOp::Update {
                    from: remote_from,
                    to: remote_to,
                },
            ) => {
                let split = split_update(local_from, local_to, remote_from, remote_to);
                if !split.applied_from.is_empty() || !split.applied_to.is_empty() {
                    let mut stripped = remote_change.clone();
                    stripped.op = ChangeOp::Update {
                        from: split.applied_from,
                        to: split.applied_to,
                    };
                    resolution.not_conflicted_server_changes.push(stripped);
                }
                if !split.rebased_from.is_empty() || !split.rebased_to.is_empty() {
                    tracing::debug!(
                        table,
                        key,
                        remote_change = %remote_change.id,
                        local_change = %local_id,
                        "Update/update conflict, keeping local values"
                    );
                    resolution.conflicted_changes.push(ChangeRecord::update(
                        table,
                        key,
                        split.rebased_from,
                        split.rebased_to,
                    ));
                }
            }
            (ChangeOp::Update { .. }, ChangeOp::Delete) => {
                tracing::debug!(table, key, "Remote delete supersedes pending local update");
                resolution
                    .not_conflicted_server_changes
                    .push(remote_change.clone());
                if let Some(ids) = local_ids.remove(key) {
                    resolution.discarded_local_changes.extend(ids);
                }
                resolution
                    .conflicted_changes
                    .retain(|change| change.key != key);
                pending.remove(key);
            }
            (ChangeOp::Delete, ChangeOp::Update { .. }) => {
                tracing::debug!(table, key, "Dropping remote update to locally deleted entity");
            }
            (ChangeOp::Delete, ChangeOp::Delete) => {
                resolution
                    .not_conflicted_server_changes
                    .push(remote_change.clone());
            }
        }
    }

    resolution
}

#[derive(Debug, Default)]
struct SplitUpdate {
    applied_from: Document,
    applied_to: Document,
    rebased_from: Document,
    rebased_to: Document,
}

fn split_update(
    local_from: &Document,
    local_to: &Document,
    remote_from: &Document,
    remote_to: &Document,
) -> SplitUpdate {
    let mut split = SplitUpdate::default();
    let mut seen: HashSet<&String> = HashSet::new();

    for key in remote_from.keys().chain(remote_to.keys()) {
        if !seen.insert(key) {
            continue;
        }

        let touched_locally = local_from.contains_key(key) || local_to.contains_key(key);
        let remote_value = remote_to.get(key);
        let local_value = local_to.get(key);

        let commutes = matches!(remote_value, Some(Value::Array(_)))
            || matches!(local_value, Some(Value::Array(_)));

        if !touched_locally || commutes {
            if let Some(value) = remote_from.get(key) {
                split.applied_from.insert(key.clone(), value.clone());
            }
            if let Some(value) = remote_value {
                split.applied_to.insert(key.clone(), value.clone());
            }
            continue;
        }

        if let (Some(Value::Object(remote_sub)), Some(Value::Object(local_sub))) =
            (remote_value, local_value)
        {
            let empty = Document::new();
            let sub = split_update(
                as_object(local_from.get(key)).unwrap_or(&empty),
                local_sub,
                as_object(remote_from.get(key)).unwrap_or(&empty),
                remote_sub,
            );
            if !sub.applied_to.is_empty() || !sub.applied_from.is_empty() {
                split
                    .applied_from
                    .insert(key.clone(), Value::Object(sub.applied_from));
                split
                    .applied_to
                    .insert(key.clone(), Value::Object(sub.applied_to));
            }
            if !sub.rebased_to.is_empty() || !sub.rebased_from.is_empty() {
                split
                    .rebased_from
                    .insert(key.clone(), Value::Object(sub.rebased_from));
                split
                    .rebased_to
                    .insert(key.clone(), Value::Object(sub.rebased_to));
            }
            continue;
        }

        if remote_value == local_value {
            continue;
        }
        if let Some(value) = remote_value {
            split.rebased_from.insert(key.clone(), value.clone());
        }
        if let Some(value) = local_value {
            split.rebased_to.insert(key.clone(), value.clone());
        }
    }

    split
}

fn as_object(value: Option<&Value>) -> Option<&Document> {
    value.and_then(Value::as_object)
}
