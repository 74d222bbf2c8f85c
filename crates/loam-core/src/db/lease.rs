//! Leader lease row shared by every context that opens the replica database

use libsql::Connection;

use crate::error::Result;

/// Current lease holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    /// Unix ms
    pub expires_at: i64,
}

/// Trait for leader lease storage (async)
#[allow(async_fn_in_trait)]
pub trait LeaseRepository {
    /// Take or renew the lease for `holder` until `now + ttl_ms`.
    ///
    /// Succeeds when nobody holds the lease, `holder` already holds it, or the
    /// current holder let it expire.
    async fn try_acquire(&self, holder: &str, now: i64, ttl_ms: i64) -> Result<bool>;

    /// Give the lease up if `holder` has it
    async fn release(&self, holder: &str) -> Result<bool>;

    async fn current(&self) -> Result<Option<Lease>>;
}

/// libSQL implementation of `LeaseRepository`
pub struct LibSqlLeaseRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlLeaseRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl LeaseRepository for LibSqlLeaseRepository<'_> {
    async fn try_acquire(&self, holder: &str, now: i64, ttl_ms: i64) -> Result<bool> {
        // The upsert's WHERE turns a lost race into zero affected rows.
        let affected = self
            .conn
            .execute(
                "INSERT INTO leader_lease (id, holder, expires_at) VALUES (1, ?, ?)
                 ON CONFLICT (id) DO UPDATE
                 SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE leader_lease.holder = excluded.holder OR leader_lease.expires_at < ?",
                libsql::params![holder, now + ttl_ms, now],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn release(&self, holder: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM leader_lease WHERE id = 1 AND holder = ?", [holder])
            .await?;
        Ok(removed > 0)
    }

    async fn current(&self) -> Result<Option<Lease>> {
        let mut rows = self
            .conn
            .query("SELECT holder, expires_at FROM leader_lease WHERE id = 1", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Lease {
                holder: row.get(0)?,
                expires_at: row.get(1)?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, Schema};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lease_exclusive_until_expiry() {
        let db = Database::open_in_memory(Schema::Replica).await.unwrap();
        let repo = LibSqlLeaseRepository::new(db.connection());

        assert!(repo.try_acquire("a", 1_000, 500).await.unwrap());
        assert!(!repo.try_acquire("b", 1_200, 500).await.unwrap());
        // Renewal by the holder
        assert!(repo.try_acquire("a", 1_400, 500).await.unwrap());
        assert_eq!(repo.current().await.unwrap().unwrap().expires_at, 1_900);

        // Expired: someone else may take over
        assert!(repo.try_acquire("b", 2_000, 500).await.unwrap());
        assert_eq!(repo.current().await.unwrap().unwrap().holder, "b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_release_only_by_holder() {
        let db = Database::open_in_memory(Schema::Replica).await.unwrap();
        let repo = LibSqlLeaseRepository::new(db.connection());

        assert!(repo.try_acquire("a", 0, 10_000).await.unwrap());
        assert!(!repo.release("b").await.unwrap());
        assert!(repo.release("a").await.unwrap());
        assert!(repo.current().await.unwrap().is_none());
        assert!(repo.try_acquire("b", 1, 10_000).await.unwrap());
    }
}
