//! Snapshot builder: folds an entity's ordered change history into its
//! current document.

use crate::error::InvariantViolation;
use crate::models::{ChangeOp, ChangeRecord, EntitySnapshot};

use super::merge::{apply_update, dedupe_arrays};

/// Apply one change on top of the entity's current snapshot.
///
/// Updates that arrive after a delete are folded into the revision counters
/// but leave the tombstoned document alone: delete wins.
pub fn apply_change(
    current: Option<EntitySnapshot>,
    change: &ChangeRecord,
) -> Result<EntitySnapshot, InvariantViolation> {
    if let Some(snapshot) = &current {
        if snapshot.table != change.table || snapshot.doc_id != change.key {
            return Err(InvariantViolation::ForeignChange {
                table: change.table.clone(),
                key: change.key.clone(),
                expected_table: snapshot.table.clone(),
                expected_key: snapshot.doc_id.clone(),
                change_id: change.id,
            });
        }
    }

    let mut snapshot = match (current, &change.op) {
        (None, ChangeOp::Create { obj }) => {
            let mut doc = obj.clone();
            dedupe_arrays(&mut doc);
            EntitySnapshot {
                table: change.table.clone(),
                doc_id: change.key.clone(),
                doc,
                is_deleted: false,
                last_timestamp: change.timestamp,
                revision: 0,
            }
        }
        (Some(_), ChangeOp::Create { .. }) => {
            return Err(InvariantViolation::DuplicateCreate {
                table: change.table.clone(),
                key: change.key.clone(),
                change_id: change.id,
            });
        }
        (None, op) => {
            return Err(InvariantViolation::MissingCreate {
                table: change.table.clone(),
                key: change.key.clone(),
                kind: op.kind(),
                change_id: change.id,
            });
        }
        (Some(mut snapshot), ChangeOp::Update { from, to }) => {
            if !snapshot.is_deleted {
                apply_update(&mut snapshot.doc, from, to);
            }
            snapshot
        }
        (Some(mut snapshot), ChangeOp::Delete) => {
            snapshot.is_deleted = true;
            snapshot
        }
    };

    snapshot.last_timestamp = snapshot.last_timestamp.max(change.timestamp);
    if let Some(revision) = change.revision {
        snapshot.revision = snapshot.revision.max(revision);
    }
    Ok(snapshot)
}

/// Fold changes (already in revision order) on top of an optional snapshot.
pub fn apply_changes<'a>(
    mut current: Option<EntitySnapshot>,
    changes: impl IntoIterator<Item = &'a ChangeRecord>,
) -> Result<Option<EntitySnapshot>, InvariantViolation> {
    for change in changes {
        current = Some(apply_change(current, change)?);
    }
    Ok(current)
}

/// Rebuild an entity's snapshot from its entire ordered change history.
///
/// Returns `Ok(None)` for an empty history.
pub fn build_snapshot(changes: &[ChangeRecord]) -> Result<Option<EntitySnapshot>, InvariantViolation> {
    apply_changes(None, changes)
}
