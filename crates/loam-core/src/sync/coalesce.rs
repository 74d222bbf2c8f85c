//! Outbox coalescing: collapse a replica's pending changes to one per entity.

use std::collections::HashMap;

use crate::models::{ChangeOp, ChangeRecord};

use super::merge::{apply_update, compose_updates};

/// Collapse pending changes per `(table, key)`, keeping first-seen entity order.
///
/// - `Create` + `Update` becomes one `Create` carrying the final values
/// - `Update` + `Update` composes (earliest `from`, latest `to`)
/// - `Update` + `Delete` becomes the `Delete`
/// - `Create` + `Delete` cancels out: the server never saw the entity
/// - anything after a `Delete` is dropped
/// - updates that net out to nothing are not sent
///
/// The surviving record keeps the id of the last change folded into it.
pub fn coalesce(changes: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut merged: HashMap<(String, String), Option<ChangeRecord>> = HashMap::new();

    for change in changes {
        let entity = (change.table.clone(), change.key.clone());
        match merged.get_mut(&entity) {
            None => {
                order.push(entity.clone());
                merged.insert(entity, Some(change));
            }
            Some(slot) => {
                *slot = match slot.take() {
                    Some(previous) => fold(previous, change),
                    None => {
                        tracing::warn!(
                            table = %change.table,
                            key = %change.key,
                            kind = change.op.kind(),
                            "Dropping pending change for an entity created and deleted in the same batch"
                        );
                        None
                    }
                };
            }
        }
    }

    order
        .into_iter()
        .filter_map(|entity| merged.remove(&entity).flatten())
        .filter(|change| !is_empty_update(change))
        .collect()
}

fn is_empty_update(change: &ChangeRecord) -> bool {
    matches!(&change.op, ChangeOp::Update { from, to } if from.is_empty() && to.is_empty())
}

fn fold(previous: ChangeRecord, next: ChangeRecord) -> Option<ChangeRecord> {
    let ChangeRecord {
        id,
        timestamp,
        origin_window,
        op: next_op,
        ..
    } = next;

    let op = match (previous.op.clone(), next_op) {
        (ChangeOp::Create { mut obj }, ChangeOp::Update { from, to }) => {
            apply_update(&mut obj, &from, &to);
            ChangeOp::Create { obj }
        }
        (ChangeOp::Create { .. }, ChangeOp::Delete) => return None,
        (
            ChangeOp::Update {
                from: first_from,
                to: first_to,
            },
            ChangeOp::Update { from, to },
        ) => {
            let (from, to) = compose_updates(&first_from, &first_to, &from, &to);
            ChangeOp::Update { from, to }
        }
        (ChangeOp::Update { .. } | ChangeOp::Delete, ChangeOp::Delete) => ChangeOp::Delete,
        (ChangeOp::Delete, next_op) => {
            tracing::warn!(
                table = %previous.table,
                key = %previous.key,
                kind = next_op.kind(),
                "Ignoring pending change recorded after a delete"
            );
            return Some(previous);
        }
        (_, ChangeOp::Create { .. }) => {
            tracing::error!(
                table = %previous.table,
                key = %previous.key,
                change_id = %id,
                "Pending create for an entity that already has pending changes"
            );
            return Some(previous);
        }
    };

    Some(ChangeRecord {
        id,
        timestamp,
        origin_window: origin_window.or(previous.origin_window),
        op,
        ..previous
    })
}
