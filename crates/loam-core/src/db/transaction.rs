//! Explicit transaction guard over a libSQL connection.

use libsql::Connection;

use crate::error::Result;

/// How eagerly a transaction takes the write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Lock on first write
    Deferred,
    /// Take the write lock up front; serializes writers for the whole body
    Immediate,
}

/// An open transaction.
///
/// Finish it with [`Transaction::finish`], which commits on `Ok` and rolls
/// back on `Err`, so an early `?` inside the body never leaves the connection
/// mid-transaction.
pub struct Transaction<'a> {
    conn: &'a Connection,
}

impl<'a> Transaction<'a> {
    pub async fn begin(conn: &'a Connection, mode: TransactionMode) -> Result<Self> {
        let statement = match mode {
            TransactionMode::Deferred => "BEGIN TRANSACTION",
            TransactionMode::Immediate => "BEGIN IMMEDIATE",
        };
        Self::rollback_abandoned(conn).await?;
        conn.execute(statement, ()).await?;
        Ok(Self { conn })
    }

    /// Roll back a transaction left open by a task cancelled mid-body.
    pub async fn rollback_abandoned(conn: &Connection) -> Result<()> {
        if !conn.is_autocommit() {
            tracing::warn!("Rolling back a transaction abandoned by a cancelled task");
            conn.execute("ROLLBACK", ()).await?;
        }
        Ok(())
    }

    pub const fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// Commit if the body succeeded, roll back otherwise.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                if let Err(e) = self.conn.execute("COMMIT", ()).await {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = self.conn.execute("ROLLBACK", ()).await {
                    tracing::warn!("Rollback failed after {error}: {rollback_error}");
                }
                Err(error)
            }
        }
    }
}
