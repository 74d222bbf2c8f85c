//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current replica schema version
const REPLICA_VERSION: i32 = 3;

/// Current server schema version
const SERVER_VERSION: i32 = 1;

/// Run all pending replica migrations
pub async fn run_replica(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &REPLICA_V1).await?;
    }
    if version < 2 {
        apply(conn, 2, &REPLICA_V2).await?;
    }
    if version < 3 {
        apply(conn, 3, &REPLICA_V3).await?;
    }

    Ok(())
}

/// Run all pending server migrations
pub async fn run_server(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &SERVER_V1).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Apply one migration inside its own transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            libsql::params![version],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Replica version 1: local store, outbox, sync status
const REPLICA_V1: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // Materialized entities, tombstoned rather than erased
    "CREATE TABLE IF NOT EXISTS records (
        tbl TEXT NOT NULL,
        id TEXT NOT NULL,
        doc TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (tbl, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_updated ON records(tbl, updated_at DESC)",
    // Changes not yet acknowledged by the server, in capture order
    "CREATE TABLE IF NOT EXISTS client_outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        change_id TEXT NOT NULL UNIQUE,
        tbl TEXT NOT NULL,
        key TEXT NOT NULL,
        change TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_client_outbox_entity ON client_outbox(tbl, key)",
    "CREATE TABLE IF NOT EXISTS sync_status (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        replica_id TEXT NOT NULL,
        last_applied_remote_revision INTEGER,
        last_received_remote_revision INTEGER
    )",
];

/// Replica version 2: leader lease and entity quarantine
const REPLICA_V2: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS leader_lease (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS quarantined_entities (
        tbl TEXT NOT NULL,
        id TEXT NOT NULL,
        reason TEXT NOT NULL,
        quarantined_at INTEGER NOT NULL,
        PRIMARY KEY (tbl, id)
    )",
];

/// Replica version 3: committed change batches for sibling contexts
const REPLICA_V3: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS store_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        context TEXT NOT NULL,
        events TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_store_events_created ON store_events(created_at)",
];

/// Server version 1: change log, counters, pulls, snapshots
const SERVER_V1: [&str; 10] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // Append-only change log, one revision sequence per tenant
    "CREATE TABLE IF NOT EXISTS server_changes (
        tenant TEXT NOT NULL,
        revision INTEGER NOT NULL,
        change_id TEXT NOT NULL,
        tbl TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        source_replica TEXT,
        change TEXT NOT NULL,
        PRIMARY KEY (tenant, revision),
        UNIQUE (tenant, change_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_server_changes_entity
        ON server_changes(tenant, tbl, doc_id, revision)",
    "CREATE TABLE IF NOT EXISTS server_revisions (
        tenant TEXT PRIMARY KEY,
        revision INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS server_pulls (
        pull_id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        replica_id TEXT,
        since_revision INTEGER,
        server_revision INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS server_replicas (
        tenant TEXT NOT NULL,
        replica_id TEXT NOT NULL,
        last_pulled_revision INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (tenant, replica_id)
    )",
    "CREATE TABLE IF NOT EXISTS entity_snapshots (
        tenant TEXT NOT NULL,
        tbl TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        doc TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        last_timestamp INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        PRIMARY KEY (tenant, tbl, doc_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_entity_snapshots_deleted
        ON entity_snapshots(tenant, is_deleted, revision)",
    "CREATE TABLE IF NOT EXISTS server_quarantine (
        tenant TEXT NOT NULL,
        tbl TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        quarantined_at INTEGER NOT NULL,
        PRIMARY KEY (tenant, tbl, doc_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_server_pulls_tenant ON server_pulls(tenant, created_at)",
];

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                libsql::params![name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replica_migrations() {
        let conn = setup().await;
        run_replica(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, REPLICA_VERSION);
        assert!(table_exists(&conn, "client_outbox").await);
        assert!(table_exists(&conn, "leader_lease").await);
        assert!(table_exists(&conn, "store_events").await);
        assert!(!table_exists(&conn, "server_changes").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replica_migrations_idempotent() {
        let conn = setup().await;
        run_replica(&conn).await.unwrap();
        run_replica(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, REPLICA_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_server_migrations() {
        let conn = setup().await;
        run_server(&conn).await.unwrap();
        run_server(&conn).await.unwrap();

        assert_eq!(get_version(&conn).await.unwrap(), SERVER_VERSION);
        assert!(table_exists(&conn, "server_changes").await);
        assert!(table_exists(&conn, "entity_snapshots").await);
        assert!(!table_exists(&conn, "records").await);
    }
}
