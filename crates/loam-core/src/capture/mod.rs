//! Change capture: every local write becomes a change record in the outbox.
//!
//! Writes run inside one local-store transaction together with their outbox
//! append, so an outbox entry exists exactly when the write committed.
//! Changes flagged `originates_from_remote` are replays of server changes:
//! they touch the store only and never reach the outbox.

mod debounce;
mod relay;

use std::sync::Arc;

use libsql::Connection;
use tokio::sync::Mutex;

use crate::db::{
    Database, EventLog, LibSqlEventLog, LibSqlOutbox, LibSqlRecordStore, Outbox, RecordStore,
    StoredRecord, Transaction, TransactionMode,
};
use crate::error::{Error, InvariantViolation, Result};
use crate::events::{ChangeFeed, StoreEvent};
use crate::models::{ChangeOp, ChangeRecord, Document};
use crate::sync::merge::{apply_update, dedupe_arrays, diff_documents};

pub use debounce::{DebounceHandle, Debouncer};
pub use relay::SiblingRelay;

/// Result of applying a batch of changes to the local store.
#[derive(Debug, Default)]
pub struct Applied {
    pub events: Vec<StoreEvent>,
    /// Remote changes that could not be applied; the caller quarantines them
    pub violations: Vec<InvariantViolation>,
}

/// Apply changes to the local store on `conn`.
///
/// Must run inside a transaction owned by the caller. Local changes are
/// appended to the outbox; remote ones are not. A local change that breaks
/// an invariant fails the whole batch, a remote one is reported in
/// [`Applied::violations`] and skipped.
pub async fn apply_changes(conn: &Connection, changes: &[ChangeRecord]) -> Result<Applied> {
    let outbox = LibSqlOutbox::new(conn);
    let mut applied = Applied::default();

    for change in changes {
        match apply_one(conn, change).await {
            Ok(events) => applied.events.extend(events),
            Err(Error::Invariant(violation)) if change.originates_from_remote => {
                tracing::error!(
                    table = %change.table,
                    key = %change.key,
                    change_id = %change.id,
                    revision = ?change.revision,
                    %violation,
                    "Remote change rejected by local store"
                );
                applied.violations.push(violation);
                continue;
            }
            Err(error) => return Err(error),
        }

        if !change.originates_from_remote {
            outbox.append(change).await?;
        }
    }

    Ok(applied)
}

async fn apply_one(conn: &Connection, change: &ChangeRecord) -> Result<Vec<StoreEvent>> {
    let store = if change.originates_from_remote {
        LibSqlRecordStore::remote(conn)
    } else {
        LibSqlRecordStore::new(conn)
    };
    let current = store
        .get_including_deleted(&change.table, &change.key)
        .await?;

    match (&change.op, current) {
        (ChangeOp::Create { obj }, None) => {
            let mut doc = obj.clone();
            dedupe_arrays(&mut doc);
            store
                .bulk_insert(&change.table, &[(change.key.clone(), doc)])
                .await
        }
        (ChangeOp::Create { .. }, Some(_)) if change.originates_from_remote => {
            // Redelivered create: the entity is already here.
            tracing::debug!(table = %change.table, key = %change.key, "Skipping replayed create");
            Ok(Vec::new())
        }
        (ChangeOp::Create { .. }, Some(_)) => Err(InvariantViolation::DuplicateCreate {
            table: change.table.clone(),
            key: change.key.clone(),
            change_id: change.id,
        }
        .into()),
        (op, None) => Err(InvariantViolation::MissingCreate {
            table: change.table.clone(),
            key: change.key.clone(),
            kind: op.kind(),
            change_id: change.id,
        }
        .into()),
        (ChangeOp::Update { .. }, Some(record)) if record.is_deleted => Ok(Vec::new()),
        (ChangeOp::Update { from, to }, Some(mut record)) => {
            apply_update(&mut record.doc, from, to);
            store
                .bulk_update(&change.table, &[(record.id, record.doc)])
                .await
        }
        // Someone else deleted it first; a second tombstone must not be captured.
        (ChangeOp::Delete, Some(record)) if record.is_deleted && !change.originates_from_remote => {
            Err(Error::NotFound(format!("{}/{}", change.table, change.key)))
        }
        (ChangeOp::Delete, Some(record)) => store.bulk_delete(&change.table, &[record.id]).await,
    }
}

fn validate_entity(table: &str, key: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(Error::InvalidInput("table must not be empty".to_string()));
    }
    if key.trim().is_empty() {
        return Err(Error::InvalidInput("key must not be empty".to_string()));
    }
    Ok(())
}

/// Write API of one execution context over a replica's local store.
#[derive(Clone)]
pub struct ChangeCapture {
    db: Arc<Mutex<Database>>,
    feed: ChangeFeed,
    origin_window: Option<String>,
    debounce: Option<DebounceHandle>,
}

impl ChangeCapture {
    pub fn new(db: Arc<Mutex<Database>>, feed: ChangeFeed) -> Self {
        Self {
            db,
            feed,
            origin_window: None,
            debounce: None,
        }
    }

    /// Tag captured changes with the execution context that made them
    #[must_use]
    pub fn with_origin_window(mut self, window: impl Into<String>) -> Self {
        self.origin_window = Some(window.into());
        self
    }

    /// Report committed writes to a debouncer
    #[must_use]
    pub fn with_debouncer(mut self, handle: DebounceHandle) -> Self {
        self.debounce = Some(handle);
        self
    }

    pub const fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Create an entity.
    ///
    /// Fails if the id was ever used in `table`, including by a deleted entity.
    pub async fn create(&self, table: &str, key: &str, obj: Document) -> Result<ChangeRecord> {
        validate_entity(table, key)?;
        let change = ChangeRecord::create(table, key, obj)
            .with_origin_window(self.origin_window.clone());
        self.commit(vec![change.clone()]).await?;
        tracing::debug!(table, key, change_id = %change.id, "Captured create");
        Ok(change)
    }

    /// Patch an entity's top-level fields; a `null` value removes the field.
    ///
    /// Returns `None` when the patch changes nothing.
    pub async fn update(&self, table: &str, key: &str, patch: Document) -> Result<Option<ChangeRecord>> {
        validate_entity(table, key)?;
        let db = self.db.lock().await;
        let conn = db.connection();

        let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
        let result = async {
            let current = LibSqlRecordStore::new(conn)
                .get(table, key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("{table}/{key}")))?;

            let mut next = current.doc.clone();
            for (field, value) in patch {
                if value.is_null() {
                    next.remove(&field);
                } else {
                    next.insert(field, value);
                }
            }
            dedupe_arrays(&mut next);

            let (from, to) = diff_documents(&current.doc, &next);
            if from.is_empty() && to.is_empty() {
                return Ok((None, Applied::default()));
            }

            let change = ChangeRecord::update(table, key, from, to)
                .with_origin_window(self.origin_window.clone());
            let applied = apply_changes(conn, std::slice::from_ref(&change)).await?;
            self.log_events(conn, &applied.events).await?;
            Ok((Some(change), applied))
        }
        .await;
        let (change, applied) = tx.finish(result).await?;
        drop(db);

        if let Some(change) = &change {
            tracing::debug!(table, key, change_id = %change.id, "Captured update");
            self.after_commit(applied.events);
        }
        Ok(change)
    }

    /// Delete (tombstone) an entity.
    pub async fn delete(&self, table: &str, key: &str) -> Result<ChangeRecord> {
        validate_entity(table, key)?;
        let change = ChangeRecord::delete(table, key).with_origin_window(self.origin_window.clone());
        let db = self.db.lock().await;
        let conn = db.connection();

        let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
        let result = async {
            if LibSqlRecordStore::new(conn).get(table, key).await?.is_none() {
                return Err(Error::NotFound(format!("{table}/{key}")));
            }
            let applied = apply_changes(conn, std::slice::from_ref(&change)).await?;
            self.log_events(conn, &applied.events).await?;
            Ok(applied)
        }
        .await;
        let applied = tx.finish(result).await?;
        drop(db);

        tracing::debug!(table, key, change_id = %change.id, "Captured delete");
        self.after_commit(applied.events);
        Ok(change)
    }

    /// Apply already-built changes in one transaction.
    ///
    /// Local changes are captured; changes flagged as remote are not.
    pub async fn apply(&self, changes: Vec<ChangeRecord>) -> Result<Applied> {
        self.commit(changes).await
    }

    pub async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRecord>> {
        let db = self.db.lock().await;
        LibSqlRecordStore::new(db.connection()).get(table, key).await
    }

    pub async fn get_by_ids(&self, table: &str, keys: &[String]) -> Result<Vec<StoredRecord>> {
        let db = self.db.lock().await;
        LibSqlRecordStore::new(db.connection())
            .get_by_ids(table, keys)
            .await
    }

    pub async fn list(&self, table: &str, limit: usize) -> Result<Vec<StoredRecord>> {
        let db = self.db.lock().await;
        LibSqlRecordStore::new(db.connection()).list(table, limit).await
    }

    async fn commit(&self, changes: Vec<ChangeRecord>) -> Result<Applied> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let tx = Transaction::begin(conn, TransactionMode::Immediate).await?;
        let result = async {
            let applied = apply_changes(conn, &changes).await?;
            self.log_events(conn, &applied.events).await?;
            Ok(applied)
        }
        .await;
        let applied = tx.finish(result).await?;
        drop(db);

        let captured = changes.iter().any(|change| !change.originates_from_remote);
        let events = applied.events.clone();
        self.feed.publish(events);
        if captured {
            if let Some(debounce) = &self.debounce {
                debounce.touch();
            }
        }
        Ok(applied)
    }

    /// Record committed events for sibling contexts; needs an origin window.
    async fn log_events(&self, conn: &Connection, events: &[StoreEvent]) -> Result<()> {
        if let Some(context) = &self.origin_window {
            LibSqlEventLog::new(conn).append(context, events).await?;
        }
        Ok(())
    }

    fn after_commit(&self, events: Vec<StoreEvent>) {
        self.feed.publish(events);
        if let Some(debounce) = &self.debounce {
            debounce.touch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibSqlOutbox, Schema};
    use crate::events::StoreEventKind;
    use crate::models::document;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> (Arc<Mutex<Database>>, ChangeCapture) {
        let db = Arc::new(Mutex::new(
            Database::open_in_memory(Schema::Replica).await.unwrap(),
        ));
        let capture = ChangeCapture::new(db.clone(), ChangeFeed::default());
        (db, capture)
    }

    async fn open_file(path: &std::path::Path) -> (Arc<Mutex<Database>>, ChangeCapture) {
        let db = Arc::new(Mutex::new(
            Database::open(path, Schema::Replica).await.unwrap(),
        ));
        let capture = ChangeCapture::new(db.clone(), ChangeFeed::default());
        (db, capture)
    }

    async fn outbox_changes(db: &Arc<Mutex<Database>>) -> Vec<ChangeRecord> {
        let db = db.lock().await;
        LibSqlOutbox::new(db.connection())
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.change)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_writes_record_and_outbox() {
        let (db, capture) = setup().await;
        let capture = capture.with_origin_window("tab-1");
        let mut sub = capture.feed().subscribe();

        let change = capture
            .create("notes", "n1", document(json!({"title": "A", "tags": ["x", "x"]})))
            .await
            .unwrap();

        let record = capture.get("notes", "n1").await.unwrap().unwrap();
        assert_eq!(record.doc, document(json!({"title": "A", "tags": ["x"]})));

        let pending = outbox_changes(&db).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, change.id);
        assert_eq!(pending[0].origin_window.as_deref(), Some("tab-1"));

        let batch = sub.next_batch().await.unwrap();
        assert_eq!(batch[0].kind, StoreEventKind::Created);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_create_is_rejected_without_outbox_entry() {
        let (db, capture) = setup().await;
        capture.create("notes", "n1", Document::new()).await.unwrap();

        let error = capture
            .create("notes", "n1", Document::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            Error::Invariant(InvariantViolation::DuplicateCreate { .. })
        ));
        assert_eq!(outbox_changes(&db).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_records_only_changed_fields() {
        let (db, capture) = setup().await;
        capture
            .create("notes", "n1", document(json!({"title": "A", "body": "b", "pin": true})))
            .await
            .unwrap();

        let change = capture
            .update(
                "notes",
                "n1",
                document(json!({"title": "B", "body": "b", "pin": null})),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change.op,
            ChangeOp::Update {
                from: document(json!({"title": "A", "pin": true})),
                to: document(json!({"title": "B"})),
            }
        );

        let record = capture.get("notes", "n1").await.unwrap().unwrap();
        assert_eq!(record.doc, document(json!({"title": "B", "body": "b"})));

        // No-op patch
        assert!(capture
            .update("notes", "n1", document(json!({"title": "B"})))
            .await
            .unwrap()
            .is_none());
        assert_eq!(outbox_changes(&db).await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_and_delete_missing_entity() {
        let (_db, capture) = setup().await;
        assert!(matches!(
            capture.update("notes", "nope", Document::new()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            capture.delete("notes", "nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_changes_never_reach_outbox() {
        let (db, capture) = setup().await;
        let mut sub = capture.feed().subscribe();

        let mut create = ChangeRecord::create("notes", "n1", document(json!({"title": "A"})));
        create.originates_from_remote = true;
        let mut update = ChangeRecord::update(
            "notes",
            "n1",
            document(json!({"title": "A"})),
            document(json!({"title": "B"})),
        );
        update.originates_from_remote = true;

        let applied = capture.apply(vec![create.clone(), update]).await.unwrap();
        assert!(applied.violations.is_empty());
        assert!(outbox_changes(&db).await.is_empty());
        assert_eq!(
            capture.get("notes", "n1").await.unwrap().unwrap().doc["title"],
            "B"
        );

        let batch = sub.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|event| event.from_remote));

        // Redelivery is harmless
        let applied = capture.apply(vec![create]).await.unwrap();
        assert!(applied.events.is_empty());
        assert!(outbox_changes(&db).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_violation_is_reported_not_fatal() {
        let (_db, capture) = setup().await;

        let mut orphan = ChangeRecord::delete("notes", "ghost");
        orphan.originates_from_remote = true;
        let mut create = ChangeRecord::create("notes", "n2", Document::new());
        create.originates_from_remote = true;

        let applied = capture.apply(vec![orphan, create]).await.unwrap();
        assert_eq!(applied.violations.len(), 1);
        assert_eq!(applied.violations[0].entity(), ("notes", "ghost"));
        assert!(capture.get("notes", "n2").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_update_on_tombstone_is_ignored() {
        let (_db, capture) = setup().await;
        capture
            .create("notes", "n1", document(json!({"title": "A"})))
            .await
            .unwrap();
        capture.delete("notes", "n1").await.unwrap();

        let mut update = ChangeRecord::update(
            "notes",
            "n1",
            document(json!({"title": "A"})),
            document(json!({"title": "B"})),
        );
        update.originates_from_remote = true;
        let applied = capture.apply(vec![update]).await.unwrap();
        assert!(applied.events.is_empty());
        assert!(capture.get("notes", "n1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sibling_delete_is_captured_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("replica.db");
        let (db, first) = open_file(&path).await;
        let (_, second) = open_file(&path).await;

        first.create("notes", "n1", Document::new()).await.unwrap();
        second.delete("notes", "n1").await.unwrap();

        // The tombstone is checked inside the writing transaction.
        assert!(matches!(
            first.apply(vec![ChangeRecord::delete("notes", "n1")]).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            first.delete("notes", "n1").await,
            Err(Error::NotFound(_))
        ));
        let deletes = outbox_changes(&db)
            .await
            .into_iter()
            .filter(|change| matches!(change.op, ChangeOp::Delete))
            .count();
        assert_eq!(deletes, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commits_are_logged_for_sibling_contexts() {
        let (db, capture) = setup().await;
        capture.create("notes", "n0", Document::new()).await.unwrap();
        let capture = capture.with_origin_window("tab-1");
        capture.create("notes", "n1", Document::new()).await.unwrap();
        capture.delete("notes", "n1").await.unwrap();

        let db = db.lock().await;
        let batches = LibSqlEventLog::new(db.connection()).since(0, 10).await.unwrap();
        // Writes without an origin window stay out of the log.
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|batch| batch.context == "tab-1"));
        assert_eq!(batches[1].events[0].kind, StoreEventKind::Deleted);
    }
}
