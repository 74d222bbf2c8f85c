//! End-to-end replication: several replicas against one in-process hub.

use std::sync::Arc;

use loam_core::capture::ChangeCapture;
use loam_core::db::{Database, LibSqlOutbox, Outbox, Schema};
use loam_core::models::{document, ChangeOp, Document};
use loam_core::sync::protocol::{ApplyNewChangesResponse, Command, CommandResponse};
use loam_core::sync::{CommandExecuter, MemoryConnector, StepReport, SyncTrigger, Synchronizer};
use loam_core::{ChangeFeed, ChangeRecord, ReplicaConfig, ReplicaId, SyncHub};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Mutex;

const TENANT: &str = "acme";

struct Node {
    db: Arc<Mutex<Database>>,
    capture: ChangeCapture,
    sync: Synchronizer<MemoryConnector>,
    executer: CommandExecuter,
}

impl Node {
    async fn join(hub: &SyncHub) -> Self {
        let db = Arc::new(Mutex::new(
            Database::open_in_memory(Schema::Replica).await.unwrap(),
        ));
        let feed = ChangeFeed::default();
        let capture = ChangeCapture::new(db.clone(), feed.clone());
        let sync = Synchronizer::new(
            db.clone(),
            feed,
            MemoryConnector::new(hub.clone(), TENANT),
            ReplicaConfig::default(),
            SyncTrigger::new(),
        );
        let executer = sync.connect().await.unwrap();
        Self {
            db,
            capture,
            sync,
            executer,
        }
    }

    async fn step(&self) -> StepReport {
        self.sync.step(&self.executer).await.unwrap()
    }

    async fn doc(&self, table: &str, key: &str) -> Option<Document> {
        self.capture
            .get(table, key)
            .await
            .unwrap()
            .map(|record| record.doc)
    }

    async fn outbox_len(&self) -> usize {
        let db = self.db.lock().await;
        LibSqlOutbox::new(db.connection()).count().await.unwrap()
    }
}

/// Step every node until no outbox has anything left, then once more so the
/// last pushes are pulled everywhere.
async fn settle(nodes: &[&Node]) {
    for _ in 0..5 {
        for node in nodes {
            node.step().await;
        }
        let mut pending = 0;
        for node in nodes {
            pending += node.outbox_len().await;
        }
        if pending == 0 {
            break;
        }
    }
    for node in nodes {
        node.step().await;
    }
}

fn bytes(doc: Option<&Document>) -> Option<Vec<u8>> {
    doc.map(|doc| serde_json::to_vec(doc).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn create_then_pull_from_scratch() {
    let hub = SyncHub::in_memory().await.unwrap();

    let response = hub
        .handle(
            TENANT,
            Command::ApplyNewChanges {
                replica_id: ReplicaId::new(),
                changes: vec![ChangeRecord::create(
                    "notes",
                    "n1",
                    document(json!({"title": "A"})),
                )],
                base_revision: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        response,
        CommandResponse::Applied(ApplyNewChangesResponse::Success { new_revision: 1 })
    );

    let CommandResponse::Pull(pull) = hub
        .handle(
            TENANT,
            Command::GetChanges {
                last_received_remote_revision: None,
                replica_id: None,
            },
        )
        .await
        .unwrap()
    else {
        panic!("expected a pull");
    };
    assert_eq!(pull.server_revision, 1);
    assert_eq!(pull.changes.len(), 1);
    assert!(matches!(pull.changes[0].op, ChangeOp::Create { .. }));

    let second = Node::join(&hub).await;
    let report = second.step().await;
    assert_eq!(report.pulled, 1);
    assert_eq!(second.doc("notes", "n1").await.unwrap()["title"], "A");
}

#[tokio::test(flavor = "multi_thread")]
async fn replicas_converge_byte_for_byte() {
    let hub = SyncHub::in_memory().await.unwrap();
    let a = Node::join(&hub).await;
    let b = Node::join(&hub).await;
    let c = Node::join(&hub).await;

    a.capture
        .create(
            "notes",
            "n1",
            document(json!({"title": "A", "tags": ["a"], "meta": {"color": "red"}})),
        )
        .await
        .unwrap();
    a.capture
        .create("notes", "n2", document(json!({"title": "two"})))
        .await
        .unwrap();
    settle(&[&a, &b, &c]).await;

    // Concurrent edits while everyone is "offline"
    a.capture
        .update("notes", "n1", document(json!({"title": "from-a", "tags": ["a", "b"]})))
        .await
        .unwrap();
    b.capture
        .update(
            "notes",
            "n1",
            document(json!({"tags": ["a", "c"], "meta": {"color": "blue"}})),
        )
        .await
        .unwrap();
    b.capture
        .update("notes", "n2", document(json!({"title": "b-two"})))
        .await
        .unwrap();
    c.capture.delete("notes", "n2").await.unwrap();
    c.capture
        .create("blocks", "b1", document(json!({"text": "hello"})))
        .await
        .unwrap();

    settle(&[&a, &b, &c]).await;

    for (table, key) in [("notes", "n1"), ("notes", "n2"), ("blocks", "b1")] {
        let expected = a.doc(table, key).await;
        assert_eq!(bytes(b.doc(table, key).await.as_ref()), bytes(expected.as_ref()));
        assert_eq!(bytes(c.doc(table, key).await.as_ref()), bytes(expected.as_ref()));

        let snapshot = hub.snapshot(TENANT, table, key).await.unwrap().unwrap();
        assert_eq!(snapshot.is_deleted, expected.is_none());
        if let Some(expected) = expected {
            assert_eq!(bytes(Some(&snapshot.doc)), bytes(Some(&expected)));
        }
    }

    assert_eq!(
        a.doc("notes", "n1").await.unwrap(),
        document(json!({"title": "from-a", "tags": ["a", "b", "c"], "meta": {"color": "blue"}}))
    );
    assert!(a.doc("notes", "n2").await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_wins_over_concurrent_update() {
    let hub = SyncHub::in_memory().await.unwrap();
    let x = Node::join(&hub).await;
    let y = Node::join(&hub).await;

    x.capture
        .create("notes", "e", document(json!({"title": "A"})))
        .await
        .unwrap();
    x.capture
        .create("notes", "f", document(json!({"title": "A"})))
        .await
        .unwrap();
    settle(&[&x, &y]).await;

    // Deleter syncs first
    x.capture
        .update("notes", "e", document(json!({"title": "B"})))
        .await
        .unwrap();
    y.capture.delete("notes", "e").await.unwrap();
    y.step().await;
    let report = x.step().await;
    assert_eq!(report.discarded, 1);
    assert_eq!(report.sent, 0);

    // Updater syncs first
    x.capture
        .update("notes", "f", document(json!({"title": "B"})))
        .await
        .unwrap();
    y.capture.delete("notes", "f").await.unwrap();
    x.step().await;
    settle(&[&x, &y]).await;

    for key in ["e", "f"] {
        assert!(x.doc("notes", key).await.is_none());
        assert!(y.doc("notes", key).await.is_none());
        let snapshot = hub.snapshot(TENANT, "notes", key).await.unwrap().unwrap();
        assert!(snapshot.is_deleted);
    }
    assert_eq!(x.outbox_len().await, 0);
    assert_eq!(y.outbox_len().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_array_additions_merge_as_sets() {
    let hub = SyncHub::in_memory().await.unwrap();
    let x = Node::join(&hub).await;
    let y = Node::join(&hub).await;

    x.capture
        .create("notes", "n1", document(json!({"tags": ["a"]})))
        .await
        .unwrap();
    settle(&[&x, &y]).await;

    x.capture
        .update("notes", "n1", document(json!({"tags": ["a", "b"]})))
        .await
        .unwrap();
    y.capture
        .update("notes", "n1", document(json!({"tags": ["a", "c"]})))
        .await
        .unwrap();
    settle(&[&y, &x]).await;

    let expected = document(json!({"tags": ["a", "b", "c"]}));
    assert_eq!(x.doc("notes", "n1").await.unwrap(), expected);
    assert_eq!(y.doc("notes", "n1").await.unwrap(), expected);
    assert_eq!(hub.snapshot(TENANT, "notes", "n1").await.unwrap().unwrap().doc, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_revisions_strictly_increase() {
    let hub = SyncHub::in_memory().await.unwrap();
    let a = Node::join(&hub).await;
    let b = Node::join(&hub).await;

    let mut accepted = Vec::new();
    for round in 0..5 {
        for (name, node) in [("a", &a), ("b", &b)] {
            node.capture
                .create("notes", &format!("{name}-{round}"), Document::new())
                .await
                .unwrap();
            let report = node.step().await;
            assert_eq!(report.sent, 1);
            accepted.push(report.server_revision.unwrap());
        }
    }
    assert!(accepted.windows(2).all(|pair| pair[0] < pair[1]));

    let pull = hub.get_changes(TENANT, None, None).await.unwrap();
    let revisions: Vec<u64> = pull.changes.iter().filter_map(|change| change.revision).collect();
    assert_eq!(revisions, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_changes_never_feed_back() {
    let hub = SyncHub::in_memory().await.unwrap();
    let a = Node::join(&hub).await;
    let b = Node::join(&hub).await;

    a.capture
        .create("notes", "n1", document(json!({"title": "A"})))
        .await
        .unwrap();
    a.capture
        .update("notes", "n1", document(json!({"title": "B"})))
        .await
        .unwrap();
    a.step().await;
    let revision = hub.current_revision(TENANT).await.unwrap();

    b.step().await;
    assert_eq!(b.outbox_len().await, 0);
    b.step().await;
    a.step().await;
    assert_eq!(hub.current_revision(TENANT).await.unwrap(), revision);
    assert_eq!(b.doc("notes", "n1").await.unwrap()["title"], "B");
}
