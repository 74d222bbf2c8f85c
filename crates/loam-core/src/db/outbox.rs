//! Client outbox: this replica's changes not yet acknowledged by the server

use libsql::Connection;

use crate::error::Result;
use crate::util::unix_millis_now;
use crate::models::{ChangeId, ChangeRecord};

/// A pending change with its local sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub seq: i64,
    pub change: ChangeRecord,
}

/// Trait for outbox storage operations (async)
#[allow(async_fn_in_trait)]
pub trait Outbox {
    /// Append a change; returns its sequence number
    async fn append(&self, change: &ChangeRecord) -> Result<i64>;

    /// All pending changes in capture order
    async fn list(&self) -> Result<Vec<OutboxEntry>>;

    /// Remove every entry up to and including `seq`
    async fn remove_through(&self, seq: i64) -> Result<u64>;

    /// Remove specific changes
    async fn remove_ids(&self, ids: &[ChangeId]) -> Result<u64>;

    /// Number of pending changes
    async fn count(&self) -> Result<usize>;
}

/// libSQL implementation of `Outbox`
pub struct LibSqlOutbox<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlOutbox<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl Outbox for LibSqlOutbox<'_> {
    async fn append(&self, change: &ChangeRecord) -> Result<i64> {
        let payload = serde_json::to_string(change)?;
        self.conn
            .execute(
                "INSERT INTO client_outbox (change_id, tbl, key, change, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                libsql::params![
                    change.id.as_str(),
                    change.table.as_str(),
                    change.key.as_str(),
                    payload,
                    unix_millis_now()
                ],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn list(&self) -> Result<Vec<OutboxEntry>> {
        let mut rows = self
            .conn
            .query("SELECT seq, change FROM client_outbox ORDER BY seq", ())
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload: String = row.get(1)?;
            entries.push(OutboxEntry {
                seq: row.get(0)?,
                change: serde_json::from_str(&payload)?,
            });
        }
        Ok(entries)
    }

    async fn remove_through(&self, seq: i64) -> Result<u64> {
        Ok(self
            .conn
            .execute("DELETE FROM client_outbox WHERE seq <= ?", libsql::params![seq])
            .await?)
    }

    async fn remove_ids(&self, ids: &[ChangeId]) -> Result<u64> {
        let mut removed = 0;
        for id in ids {
            removed += self
                .conn
                .execute(
                    "DELETE FROM client_outbox WHERE change_id = ?",
                    [id.as_str()],
                )
                .await?;
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM client_outbox", ())
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
