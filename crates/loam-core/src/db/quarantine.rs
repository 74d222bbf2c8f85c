//! Entities excluded from automatic reconciliation after an invariant violation

use libsql::Connection;

use crate::error::{InvariantViolation, Result};
use crate::util::unix_millis_now;

/// A quarantined entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedEntity {
    pub table: String,
    pub id: String,
    pub reason: String,
    pub quarantined_at: i64,
}

/// Trait for quarantine storage (async)
#[allow(async_fn_in_trait)]
pub trait QuarantineRepository {
    /// Record a violation; the first reason for an entity is kept
    async fn quarantine(&self, violation: &InvariantViolation) -> Result<()>;

    async fn is_quarantined(&self, table: &str, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<QuarantinedEntity>>;

    /// Put an entity back under automatic reconciliation
    async fn release(&self, table: &str, id: &str) -> Result<bool>;
}

/// libSQL implementation of `QuarantineRepository`
pub struct LibSqlQuarantineRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlQuarantineRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl QuarantineRepository for LibSqlQuarantineRepository<'_> {
    async fn quarantine(&self, violation: &InvariantViolation) -> Result<()> {
        let (table, id) = violation.entity();
        tracing::error!(table, key = id, %violation, "Quarantining entity");
        self.conn
            .execute(
                "INSERT OR IGNORE INTO quarantined_entities (tbl, id, reason, quarantined_at)
                 VALUES (?, ?, ?, ?)",
                libsql::params![
                    table,
                    id,
                    violation.to_string(),
                    unix_millis_now()
                ],
            )
            .await?;
        Ok(())
    }

    async fn is_quarantined(&self, table: &str, id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM quarantined_entities WHERE tbl = ? AND id = ?",
                [table, id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    async fn list(&self) -> Result<Vec<QuarantinedEntity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT tbl, id, reason, quarantined_at FROM quarantined_entities
                 ORDER BY quarantined_at, tbl, id",
                (),
            )
            .await?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            entities.push(QuarantinedEntity {
                table: row.get(0)?,
                id: row.get(1)?,
                reason: row.get(2)?,
                quarantined_at: row.get(3)?,
            });
        }
        Ok(entities)
    }

    async fn release(&self, table: &str, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM quarantined_entities WHERE tbl = ? AND id = ?",
                [table, id],
            )
            .await?;
        Ok(removed > 0)
    }
}
