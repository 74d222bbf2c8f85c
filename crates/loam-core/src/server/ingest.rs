//! Server change ingestor and pull builder.
//!
//! Both run against a connection the caller has already serialized per
//! tenant; each call is one all-or-nothing transaction.

use std::collections::BTreeMap;

use libsql::Connection;
use uuid::Uuid;

use crate::db::{Transaction, TransactionMode};
use crate::error::Result;
use crate::models::{ChangeRecord, ChangesPull, EntitySnapshot, ReplicaId};
use crate::sync::protocol::ApplyNewChangesResponse;
use crate::sync::snapshot::{apply_changes, build_snapshot};

use super::log::ChangeLog;

/// Per-entity outcome of one ingested batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    pub response: Option<ApplyNewChangesResponse>,
    /// Snapshots written, by path taken
    pub fast_path: usize,
    pub rebuilt: usize,
    /// Entities quarantined by this batch
    pub quarantined: Vec<(String, String)>,
}

/// Assign revisions to `changes`, append them to the tenant's log and bring
/// the touched snapshots up to date.
///
/// `base_revision` must equal the tenant's current revision (`None` only
/// while the tenant has no changes), otherwise nothing is written and
/// `stale_changes` is returned. Changes whose id is already in the log are
/// skipped, which makes resubmitting a batch harmless.
pub async fn ingest(
    conn: &Connection,
    tenant: &str,
    replica_id: ReplicaId,
    changes: Vec<ChangeRecord>,
    base_revision: Option<u64>,
) -> Result<IngestReport> {
    let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
    let result = ingest_in_transaction(conn, tenant, replica_id, changes, base_revision).await;
    tx.finish(result).await
}

async fn ingest_in_transaction(
    conn: &Connection,
    tenant: &str,
    replica_id: ReplicaId,
    changes: Vec<ChangeRecord>,
    base_revision: Option<u64>,
) -> Result<IngestReport> {
    let log = ChangeLog::new(conn, tenant);
    let current = log.current_revision().await?;
    let mut report = IngestReport::default();

    if base_revision.unwrap_or(0) != current {
        tracing::debug!(
            tenant,
            replica = %replica_id,
            base = ?base_revision,
            current,
            "Rejecting stale batch"
        );
        report.response = Some(ApplyNewChangesResponse::StaleChanges);
        return Ok(report);
    }

    let mut revision = current;
    let mut by_entity: BTreeMap<(String, String), Vec<ChangeRecord>> = BTreeMap::new();
    for mut change in changes {
        if log.contains_change(&change).await? {
            tracing::debug!(tenant, change_id = %change.id, "Skipping already ingested change");
            continue;
        }
        revision += 1;
        change.revision = Some(revision);
        change.source_replica = Some(replica_id);
        change.originates_from_remote = false;
        change.pull_id = None;
        log.append(&change).await?;
        by_entity
            .entry((change.table.clone(), change.key.clone()))
            .or_default()
            .push(change);
    }

    for ((table, key), entity_changes) in by_entity {
        if log.is_quarantined(&table, &key).await? {
            tracing::warn!(tenant, table, key, "Entity is quarantined, snapshot left as is");
            continue;
        }

        let (snapshot, fast) = rebuild_entity(&log, &table, &key, &entity_changes).await?;
        match snapshot {
            Ok(Some(snapshot)) => {
                log.upsert_snapshot(&snapshot).await?;
                if fast {
                    report.fast_path += 1;
                } else {
                    report.rebuilt += 1;
                }
            }
            Ok(None) => {}
            Err(violation) => {
                tracing::error!(
                    tenant,
                    table,
                    key,
                    changes = ?entity_changes,
                    %violation,
                    "Change log invariant violated, quarantining entity"
                );
                log.quarantine(&violation).await?;
                report.quarantined.push((table, key));
            }
        }
    }

    if revision != current {
        log.set_revision(revision).await?;
    }
    tracing::info!(tenant, replica = %replica_id, from = current, to = revision, "Ingested batch");
    report.response = Some(ApplyNewChangesResponse::Success {
        new_revision: revision,
    });
    Ok(report)
}

type Rebuilt = std::result::Result<Option<EntitySnapshot>, crate::error::InvariantViolation>;

/// Fold the new changes of one entity into its snapshot.
///
/// Fast path when a snapshot exists and no older change of the entity is
/// stamped at or after the earliest new one; full replay of the entity's
/// history otherwise.
async fn rebuild_entity(
    log: &ChangeLog<'_>,
    table: &str,
    key: &str,
    changes: &[ChangeRecord],
) -> Result<(Rebuilt, bool)> {
    let first_revision = changes
        .iter()
        .filter_map(|change| change.revision)
        .min()
        .unwrap_or_default();
    let min_timestamp = changes
        .iter()
        .map(|change| change.timestamp)
        .min()
        .unwrap_or_default();

    let existing = log.snapshot(table, key).await?;
    let interleaved = log
        .has_interleaved_change(table, key, first_revision, min_timestamp)
        .await?;

    if let Some(snapshot) = existing {
        if !interleaved {
            return Ok((apply_changes(Some(snapshot), changes), true));
        }
    }

    tracing::debug!(table, key, "Rebuilding snapshot from full history");
    let history = log.entity_history(table, key).await?;
    Ok((build_snapshot(&history), false))
}

/// Cut a pull of every change after `since`, and record who pulled it.
pub async fn pull(
    conn: &Connection,
    tenant: &str,
    since: Option<u64>,
    replica_id: Option<ReplicaId>,
) -> Result<ChangesPull> {
    let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
    let result = async {
        let log = ChangeLog::new(conn, tenant);
        let server_revision = log.current_revision().await?;
        let pull_id = Uuid::now_v7().to_string();

        let mut changes = log.changes_since(since.unwrap_or(0)).await?;
        for change in &mut changes {
            change.pull_id = Some(pull_id.clone());
        }

        log.record_pull(&pull_id, replica_id, since, server_revision)
            .await?;
        tracing::debug!(
            tenant,
            pull_id = %pull_id,
            since = ?since,
            server_revision,
            count = changes.len(),
            "Cut pull"
        );

        Ok(ChangesPull {
            pull_id,
            server_revision,
            changes,
        })
    }
    .await;
    tx.finish(result).await
}

/// Outcome of a compaction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub entities: usize,
    pub changes: u64,
}

/// Drop the history of deleted entities every known replica has already
/// pulled past. Live entities keep their full history.
pub async fn compact(conn: &Connection, tenant: &str) -> Result<CompactionReport> {
    let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
    let result = async {
        let log = ChangeLog::new(conn, tenant);
        let mut report = CompactionReport::default();

        let Some(horizon) = log.min_pulled_revision().await? else {
            return Ok(report);
        };
        for (table, key) in log.deleted_entities_through(horizon).await? {
            report.changes += log.purge_entity(&table, &key).await?;
            report.entities += 1;
        }

        tracing::info!(
            tenant,
            horizon,
            entities = report.entities,
            changes = report.changes,
            "Compacted change log"
        );
        Ok(report)
    }
    .await;
    tx.finish(result).await
}
