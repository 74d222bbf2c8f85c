//! Sync status repository (one row per replica database)

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite stores revisions as i64

use libsql::Connection;

use crate::error::{Error, Result};
use crate::models::{ReplicaId, SyncStatus};

/// Trait for sync status storage (async)
#[allow(async_fn_in_trait)]
pub trait SyncStatusRepository {
    /// Load the status, creating it with a fresh replica id on first use
    async fn load_or_init(&self) -> Result<SyncStatus>;

    /// Persist the status
    async fn save(&self, status: &SyncStatus) -> Result<()>;
}

/// libSQL implementation of `SyncStatusRepository`
pub struct LibSqlSyncStatusRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncStatusRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn load(&self) -> Result<Option<SyncStatus>> {
        let mut rows = self
            .conn
            .query(
                "SELECT replica_id, last_applied_remote_revision, last_received_remote_revision
                 FROM sync_status WHERE id = 1",
                (),
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let replica_id: String = row.get(0)?;
        let replica_id: ReplicaId = replica_id
            .parse()
            .map_err(|_| Error::Database(format!("Invalid replica id in sync_status: {replica_id}")))?;

        Ok(Some(SyncStatus {
            replica_id,
            last_applied_remote_revision: optional_revision(&row, 1)?,
            last_received_remote_revision: optional_revision(&row, 2)?,
        }))
    }
}

fn optional_revision(row: &libsql::Row, idx: i32) -> Result<Option<u64>> {
    match row.get_value(idx)? {
        libsql::Value::Integer(value) => Ok(Some(value as u64)),
        libsql::Value::Null => Ok(None),
        other => Err(Error::Database(format!("Unexpected revision value: {other:?}"))),
    }
}

impl SyncStatusRepository for LibSqlSyncStatusRepository<'_> {
    async fn load_or_init(&self) -> Result<SyncStatus> {
        if let Some(status) = self.load().await? {
            return Ok(status);
        }

        let status = SyncStatus::new(ReplicaId::new());
        // Another context may have initialized it concurrently; its row wins.
        self.conn
            .execute(
                "INSERT OR IGNORE INTO sync_status (id, replica_id) VALUES (1, ?)",
                [status.replica_id.as_str()],
            )
            .await?;
        tracing::info!(replica = %status.replica_id, "Initialized sync status");

        self.load()
            .await?
            .ok_or_else(|| Error::Database("sync_status row missing after insert".to_string()))
    }

    async fn save(&self, status: &SyncStatus) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_status
                    (id, replica_id, last_applied_remote_revision, last_received_remote_revision)
                 VALUES (1, ?, ?, ?)
                 ON CONFLICT (id) DO UPDATE SET
                    replica_id = excluded.replica_id,
                    last_applied_remote_revision = excluded.last_applied_remote_revision,
                    last_received_remote_revision = excluded.last_received_remote_revision",
                libsql::params![
                    status.replica_id.as_str(),
                    status.last_applied_remote_revision.map(|r| r as i64),
                    status.last_received_remote_revision.map(|r| r as i64)
                ],
            )
            .await?;
        Ok(())
    }
}
