//! Advisory lock serializing migration runs.
//!
//! The lock is a single-row table next to the ledger. Taking it is one
//! `INSERT OR IGNORE`, so two runners racing for it cannot both win. It is
//! taken outside of any unit transaction and stays held across all of them.

use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};

/// Current lock holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Holder identity as given to [`LedgerLock::acquire`].
    pub holder: String,
    /// When the lock was taken (RFC 3339).
    pub acquired_at: String,
}

/// The lock table belonging to one ledger.
#[derive(Debug, Clone)]
pub struct LedgerLock {
    table: String,
}

impl LedgerLock {
    /// The lock for the ledger stored in `ledger_table`.
    pub fn for_ledger(ledger_table: &str) -> Self {
        Self {
            table: format!("{}_lock", ledger_table),
        }
    }

    /// Lock table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.table)
    }

    /// Ensures the lock table exists.
    pub async fn ensure_table(&self, conn: &mut SqliteConnection) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL
)",
            self.quoted()
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    /// Takes the lock for `holder`.
    ///
    /// Fails with [`MigrateError::LockContention`] if anyone holds it,
    /// including `holder` itself.
    pub async fn acquire(&self, conn: &mut SqliteConnection, holder: &str) -> Result<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (id, holder, acquired_at) VALUES (1, ?, ?)",
            self.quoted()
        );
        let result = sqlx::query(&sql)
            .bind(holder)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 1 {
            debug!(holder = %holder, "Acquired migration lock");
            return Ok(());
        }

        match self.holder(conn).await? {
            Some(current) => Err(MigrateError::LockContention {
                holder: current.holder,
                since: current.acquired_at,
            }),
            // Released between our insert and read; the caller may retry.
            None => Err(MigrateError::LockContention {
                holder: String::from("<released>"),
                since: Utc::now().to_rfc3339(),
            }),
        }
    }

    /// Releases the lock if `holder` holds it. Returns whether it did.
    pub async fn release(&self, conn: &mut SqliteConnection, holder: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = 1 AND holder = ?", self.quoted());
        let result = sqlx::query(&sql).bind(holder).execute(&mut *conn).await?;

        if result.rows_affected() == 0 {
            warn!(holder = %holder, "Migration lock was not held by this runner");
            return Ok(false);
        }
        debug!(holder = %holder, "Released migration lock");
        Ok(true)
    }

    /// Releases the lock whoever holds it, returning the previous holder.
    pub async fn force_release(&self, conn: &mut SqliteConnection) -> Result<Option<LockHolder>> {
        let previous = self.holder(conn).await?;
        if previous.is_some() {
            let sql = format!("DELETE FROM {} WHERE id = 1", self.quoted());
            sqlx::query(&sql).execute(&mut *conn).await?;
        }
        Ok(previous)
    }

    /// Returns the current holder, if the lock is held.
    pub async fn holder(&self, conn: &mut SqliteConnection) -> Result<Option<LockHolder>> {
        let sql = format!(
            "SELECT holder, acquired_at FROM {} WHERE id = 1",
            self.quoted()
        );
        let row: Option<(String, String)> =
            sqlx::query_as(&sql).fetch_optional(&mut *conn).await?;
        Ok(row.map(|(holder, acquired_at)| LockHolder {
            holder,
            acquired_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let lock = LedgerLock::for_ledger("__migration_ledger");
        assert_eq!(lock.table_name(), "__migration_ledger_lock");
        lock.ensure_table(&mut conn).await.unwrap();

        lock.acquire(&mut conn, "deploy-1").await.unwrap();
        let holder = lock.holder(&mut conn).await.unwrap().unwrap();
        assert_eq!(holder.holder, "deploy-1");

        assert!(lock.release(&mut conn, "deploy-1").await.unwrap());
        assert!(lock.holder(&mut conn).await.unwrap().is_none());
        assert!(!lock.release(&mut conn, "deploy-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_contention() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let lock = LedgerLock::for_ledger("__migration_ledger");
        lock.ensure_table(&mut conn).await.unwrap();

        lock.acquire(&mut conn, "deploy-1").await.unwrap();

        match lock.acquire(&mut conn, "deploy-2").await {
            Err(MigrateError::LockContention { holder, .. }) => assert_eq!(holder, "deploy-1"),
            other => panic!("Expected LockContention, got {other:?}"),
        }
        // Not re-entrant
        assert!(matches!(
            lock.acquire(&mut conn, "deploy-1").await,
            Err(MigrateError::LockContention { .. })
        ));

        // Someone else's release does nothing
        assert!(!lock.release(&mut conn, "deploy-2").await.unwrap());
        assert!(lock.holder(&mut conn).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_force_release() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let lock = LedgerLock::for_ledger("__migration_ledger");
        lock.ensure_table(&mut conn).await.unwrap();

        assert!(lock.force_release(&mut conn).await.unwrap().is_none());

        lock.acquire(&mut conn, "crashed-runner").await.unwrap();
        let previous = lock.force_release(&mut conn).await.unwrap().unwrap();
        assert_eq!(previous.holder, "crashed-runner");

        lock.acquire(&mut conn, "deploy-2").await.unwrap();
    }
}
