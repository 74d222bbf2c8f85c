//! Per-tenant change log, snapshot and bookkeeping tables

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite stores revisions as i64

use libsql::Connection;

use crate::error::{InvariantViolation, Result};
use crate::models::{ChangeRecord, EntitySnapshot, ReplicaId};
use crate::util::unix_millis_now;

/// Queries over one tenant's slice of the server database.
pub struct ChangeLog<'a> {
    conn: &'a Connection,
    tenant: &'a str,
}

impl<'a> ChangeLog<'a> {
    pub const fn new(conn: &'a Connection, tenant: &'a str) -> Self {
        Self { conn, tenant }
    }

    /// Highest assigned revision, 0 before the first change
    pub async fn current_revision(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT revision FROM server_revisions WHERE tenant = ?",
                [self.tenant],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    pub async fn set_revision(&self, revision: u64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO server_revisions (tenant, revision) VALUES (?, ?)
                 ON CONFLICT (tenant) DO UPDATE SET revision = excluded.revision",
                libsql::params![self.tenant, revision as i64],
            )
            .await?;
        Ok(())
    }

    pub async fn contains_change(&self, change: &ChangeRecord) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM server_changes WHERE tenant = ? AND change_id = ?",
                libsql::params![self.tenant, change.id.as_str()],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Append a change that already carries its revision
    pub async fn append(&self, change: &ChangeRecord) -> Result<()> {
        let revision = change.revision.unwrap_or_default() as i64;
        self.conn
            .execute(
                "INSERT INTO server_changes
                    (tenant, revision, change_id, tbl, doc_id, timestamp, source_replica, change)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    self.tenant,
                    revision,
                    change.id.as_str(),
                    change.table.as_str(),
                    change.key.as_str(),
                    change.timestamp,
                    change.source_replica.map(|id| id.as_str()),
                    serde_json::to_string(change)?
                ],
            )
            .await?;
        Ok(())
    }

    /// All changes after `revision`, in revision order
    pub async fn changes_since(&self, revision: u64) -> Result<Vec<ChangeRecord>> {
        let rows = self
            .conn
            .query(
                "SELECT change FROM server_changes
                 WHERE tenant = ? AND revision > ?
                 ORDER BY revision",
                libsql::params![self.tenant, revision as i64],
            )
            .await?;
        Self::parse_changes(rows).await
    }

    /// An entity's entire history, in revision order
    pub async fn entity_history(&self, table: &str, doc_id: &str) -> Result<Vec<ChangeRecord>> {
        let rows = self
            .conn
            .query(
                "SELECT change FROM server_changes
                 WHERE tenant = ? AND tbl = ? AND doc_id = ?
                 ORDER BY revision",
                [self.tenant, table, doc_id],
            )
            .await?;
        Self::parse_changes(rows).await
    }

    async fn parse_changes(mut rows: libsql::Rows) -> Result<Vec<ChangeRecord>> {
        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload: String = row.get(0)?;
            changes.push(serde_json::from_str(&payload)?);
        }
        Ok(changes)
    }

    /// Whether an older change of the entity is stamped at or after `since_timestamp`
    pub async fn has_interleaved_change(
        &self,
        table: &str,
        doc_id: &str,
        before_revision: u64,
        since_timestamp: i64,
    ) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM server_changes
                 WHERE tenant = ? AND tbl = ? AND doc_id = ?
                   AND revision < ? AND timestamp >= ?
                 LIMIT 1",
                libsql::params![
                    self.tenant,
                    table,
                    doc_id,
                    before_revision as i64,
                    since_timestamp
                ],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn snapshot(&self, table: &str, doc_id: &str) -> Result<Option<EntitySnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT doc, is_deleted, last_timestamp, revision FROM entity_snapshots
                 WHERE tenant = ? AND tbl = ? AND doc_id = ?",
                [self.tenant, table, doc_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let doc: String = row.get(0)?;
        Ok(Some(EntitySnapshot {
            table: table.to_string(),
            doc_id: doc_id.to_string(),
            doc: serde_json::from_str(&doc)?,
            is_deleted: row.get::<i32>(1)? != 0,
            last_timestamp: row.get(2)?,
            revision: row.get::<i64>(3)? as u64,
        }))
    }

    pub async fn upsert_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO entity_snapshots
                    (tenant, tbl, doc_id, doc, is_deleted, last_timestamp, revision)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (tenant, tbl, doc_id) DO UPDATE SET
                    doc = excluded.doc,
                    is_deleted = excluded.is_deleted,
                    last_timestamp = excluded.last_timestamp,
                    revision = excluded.revision",
                libsql::params![
                    self.tenant,
                    snapshot.table.as_str(),
                    snapshot.doc_id.as_str(),
                    serde_json::to_string(&snapshot.doc)?,
                    i32::from(snapshot.is_deleted),
                    snapshot.last_timestamp,
                    snapshot.revision as i64
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn quarantine(&self, violation: &InvariantViolation) -> Result<()> {
        let (table, doc_id) = violation.entity();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO server_quarantine (tenant, tbl, doc_id, reason, quarantined_at)
                 VALUES (?, ?, ?, ?, ?)",
                libsql::params![
                    self.tenant,
                    table,
                    doc_id,
                    violation.to_string(),
                    unix_millis_now()
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn is_quarantined(&self, table: &str, doc_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM server_quarantine WHERE tenant = ? AND tbl = ? AND doc_id = ?",
                [self.tenant, table, doc_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Remember that a pull was cut, and how far the pulling replica now is
    pub async fn record_pull(
        &self,
        pull_id: &str,
        replica_id: Option<ReplicaId>,
        since: Option<u64>,
        server_revision: u64,
    ) -> Result<()> {
        let now = unix_millis_now();
        self.conn
            .execute(
                "INSERT INTO server_pulls
                    (pull_id, tenant, replica_id, since_revision, server_revision, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    pull_id,
                    self.tenant,
                    replica_id.map(|id| id.as_str()),
                    since.map(|r| r as i64),
                    server_revision as i64,
                    now
                ],
            )
            .await?;

        if let Some(replica_id) = replica_id {
            self.conn
                .execute(
                    "INSERT INTO server_replicas (tenant, replica_id, last_pulled_revision, updated_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (tenant, replica_id) DO UPDATE SET
                        last_pulled_revision = MAX(last_pulled_revision, excluded.last_pulled_revision),
                        updated_at = excluded.updated_at",
                    libsql::params![self.tenant, replica_id.as_str(), server_revision as i64, now],
                )
                .await?;
        }
        Ok(())
    }

    /// Lowest revision every known replica has pulled up to
    pub async fn min_pulled_revision(&self) -> Result<Option<u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT MIN(last_pulled_revision) FROM server_replicas WHERE tenant = ?",
                [self.tenant],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        match row.get_value(0)? {
            libsql::Value::Integer(revision) => Ok(Some(revision as u64)),
            _ => Ok(None),
        }
    }

    /// Tombstoned entities whose last change is at or below `revision`
    pub async fn deleted_entities_through(&self, revision: u64) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT tbl, doc_id FROM entity_snapshots
                 WHERE tenant = ? AND is_deleted = 1 AND revision <= ?
                 ORDER BY tbl, doc_id",
                libsql::params![self.tenant, revision as i64],
            )
            .await?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            entities.push((row.get(0)?, row.get(1)?));
        }
        Ok(entities)
    }

    /// Drop an entity's history and snapshot; returns the number of changes removed
    pub async fn purge_entity(&self, table: &str, doc_id: &str) -> Result<u64> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM server_changes WHERE tenant = ? AND tbl = ? AND doc_id = ?",
                [self.tenant, table, doc_id],
            )
            .await?;
        self.conn
            .execute(
                "DELETE FROM entity_snapshots WHERE tenant = ? AND tbl = ? AND doc_id = ?",
                [self.tenant, table, doc_id],
            )
            .await?;
        Ok(removed)
    }
}
