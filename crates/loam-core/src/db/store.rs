//! Local record store
//!
//! Rows are keyed by `(table, id)` and hold a JSON document. Deletes are
//! tombstones: the document stays behind with `is_deleted = 1`.

use libsql::Connection;

use crate::error::Result;
use crate::events::{StoreEvent, StoreEventKind};
use crate::models::Document;
use crate::util::unix_millis_now;

/// One stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub table: String,
    pub id: String,
    pub doc: Document,
    pub is_deleted: bool,
    /// Last local write (Unix ms)
    pub updated_at: i64,
}

/// Trait for local record storage (async)
///
/// Write methods return one event per affected row. They do not publish
/// anything themselves: the caller publishes after its transaction commits.
#[allow(async_fn_in_trait)]
pub trait RecordStore {
    /// Get a live record (tombstones excluded)
    async fn get(&self, table: &str, id: &str) -> Result<Option<StoredRecord>>;

    /// Get a record even if it has been deleted
    async fn get_including_deleted(&self, table: &str, id: &str) -> Result<Option<StoredRecord>>;

    /// Get the live records among `ids`, in the order given
    async fn get_by_ids(&self, table: &str, ids: &[String]) -> Result<Vec<StoredRecord>>;

    /// List live records of a table, most recently written first
    async fn list(&self, table: &str, limit: usize) -> Result<Vec<StoredRecord>>;

    /// Insert rows, replacing any existing row with the same id
    async fn bulk_insert(&self, table: &str, rows: &[(String, Document)]) -> Result<Vec<StoreEvent>>;

    /// Replace the documents of existing rows; unknown ids are skipped
    async fn bulk_update(&self, table: &str, rows: &[(String, Document)]) -> Result<Vec<StoreEvent>>;

    /// Tombstone rows; unknown ids are skipped
    async fn bulk_delete(&self, table: &str, ids: &[String]) -> Result<Vec<StoreEvent>>;
}

/// libSQL implementation of `RecordStore`
pub struct LibSqlRecordStore<'a> {
    conn: &'a Connection,
    from_remote: bool,
}

impl<'a> LibSqlRecordStore<'a> {
    /// Store for local writes
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            from_remote: false,
        }
    }

    /// Store whose events are tagged as replayed server changes
    pub const fn remote(conn: &'a Connection) -> Self {
        Self {
            conn,
            from_remote: true,
        }
    }

    fn event(&self, table: &str, key: &str, kind: StoreEventKind) -> StoreEvent {
        StoreEvent {
            table: table.to_string(),
            key: key.to_string(),
            kind,
            from_remote: self.from_remote,
        }
    }

    fn parse_record(row: &libsql::Row) -> Result<StoredRecord> {
        let doc: String = row.get(2)?;
        Ok(StoredRecord {
            table: row.get(0)?,
            id: row.get(1)?,
            doc: serde_json::from_str(&doc)?,
            is_deleted: row.get::<i32>(3)? != 0,
            updated_at: row.get(4)?,
        })
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<StoredRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT tbl, id, doc, is_deleted, updated_at FROM records WHERE tbl = ? AND id = ?",
                [table, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }
}

impl RecordStore for LibSqlRecordStore<'_> {
    async fn get(&self, table: &str, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .fetch(table, id)
            .await?
            .filter(|record| !record.is_deleted))
    }

    async fn get_including_deleted(&self, table: &str, id: &str) -> Result<Option<StoredRecord>> {
        self.fetch(table, id).await
    }

    async fn get_by_ids(&self, table: &str, ids: &[String]) -> Result<Vec<StoredRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(table, id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list(&self, table: &str, limit: usize) -> Result<Vec<StoredRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT tbl, id, doc, is_deleted, updated_at FROM records
                 WHERE tbl = ? AND is_deleted = 0
                 ORDER BY updated_at DESC, id
                 LIMIT ?",
                libsql::params![table, limit],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    async fn bulk_insert(&self, table: &str, rows: &[(String, Document)]) -> Result<Vec<StoreEvent>> {
        let now = unix_millis_now();
        let mut events = Vec::with_capacity(rows.len());

        for (id, doc) in rows {
            let doc = serde_json::to_string(doc)?;
            self.conn
                .execute(
                    "INSERT INTO records (tbl, id, doc, is_deleted, updated_at)
                     VALUES (?, ?, ?, 0, ?)
                     ON CONFLICT (tbl, id) DO UPDATE
                     SET doc = excluded.doc, is_deleted = 0, updated_at = excluded.updated_at",
                    libsql::params![table, id.as_str(), doc, now],
                )
                .await?;
            events.push(self.event(table, id, StoreEventKind::Created));
        }

        Ok(events)
    }

    async fn bulk_update(&self, table: &str, rows: &[(String, Document)]) -> Result<Vec<StoreEvent>> {
        let now = unix_millis_now();
        let mut events = Vec::with_capacity(rows.len());

        for (id, doc) in rows {
            let doc = serde_json::to_string(doc)?;
            let affected = self
                .conn
                .execute(
                    "UPDATE records SET doc = ?, updated_at = ? WHERE tbl = ? AND id = ?",
                    libsql::params![doc, now, table, id.as_str()],
                )
                .await?;
            if affected > 0 {
                events.push(self.event(table, id, StoreEventKind::Updated));
            }
        }

        Ok(events)
    }

    async fn bulk_delete(&self, table: &str, ids: &[String]) -> Result<Vec<StoreEvent>> {
        let now = unix_millis_now();
        let mut events = Vec::with_capacity(ids.len());

        for id in ids {
            let affected = self
                .conn
                .execute(
                    "UPDATE records SET is_deleted = 1, updated_at = ?
                     WHERE tbl = ? AND id = ? AND is_deleted = 0",
                    libsql::params![now, table, id.as_str()],
                )
                .await?;
            if affected > 0 {
                events.push(self.event(table, id, StoreEventKind::Deleted));
            }
        }

        Ok(events)
    }
}
