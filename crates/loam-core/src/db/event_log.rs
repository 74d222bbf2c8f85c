//! Committed change batches, readable by every context that opens the
//! replica database

use libsql::Connection;

use crate::error::Result;
use crate::events::StoreEvent;
use crate::util::unix_millis_now;

/// One committed batch as recorded by the context that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedBatch {
    pub seq: i64,
    pub context: String,
    pub events: Vec<StoreEvent>,
}

impl LoggedBatch {
    /// Whether any event came from a local write rather than a pull
    pub fn has_local_writes(&self) -> bool {
        self.events.iter().any(|event| !event.from_remote)
    }
}

/// Trait for the shared event log (async)
#[allow(async_fn_in_trait)]
pub trait EventLog {
    /// Record a batch; empty batches are not recorded
    async fn append(&self, context: &str, events: &[StoreEvent]) -> Result<Option<i64>>;

    /// Batches after `seq`, oldest first
    async fn since(&self, seq: i64, limit: usize) -> Result<Vec<LoggedBatch>>;

    /// Highest recorded sequence number, 0 when empty
    async fn latest_seq(&self) -> Result<i64>;

    /// Remove batches recorded before `cutoff` (Unix ms)
    async fn prune_before(&self, cutoff: i64) -> Result<u64>;
}

/// libSQL implementation of `EventLog`
pub struct LibSqlEventLog<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEventLog<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl EventLog for LibSqlEventLog<'_> {
    async fn append(&self, context: &str, events: &[StoreEvent]) -> Result<Option<i64>> {
        if events.is_empty() {
            return Ok(None);
        }
        let payload = serde_json::to_string(events)?;
        self.conn
            .execute(
                "INSERT INTO store_events (context, events, created_at) VALUES (?, ?, ?)",
                libsql::params![context, payload, unix_millis_now()],
            )
            .await?;
        Ok(Some(self.conn.last_insert_rowid()))
    }

    async fn since(&self, seq: i64, limit: usize) -> Result<Vec<LoggedBatch>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT seq, context, events FROM store_events
                 WHERE seq > ? ORDER BY seq LIMIT ?",
                libsql::params![seq, limit],
            )
            .await?;

        let mut batches = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload: String = row.get(2)?;
            batches.push(LoggedBatch {
                seq: row.get(0)?,
                context: row.get(1)?,
                events: serde_json::from_str(&payload)?,
            });
        }
        Ok(batches)
    }

    async fn latest_seq(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COALESCE(MAX(seq), 0) FROM store_events", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    async fn prune_before(&self, cutoff: i64) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM store_events WHERE created_at < ?",
                libsql::params![cutoff],
            )
            .await?)
    }
}
