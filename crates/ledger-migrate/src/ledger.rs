//! Migration ledger.
//!
//! This module manages the ledger table that records which units have been
//! applied to the database. The ledger is the only source of truth for
//! migration state: a unit is applied exactly when its row exists.
//!
//! All methods take a connection so that ledger writes can share the
//! transaction of the unit they record.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;

use crate::error::{MigrateError, Result};
use crate::unit::MigrationUnit;

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "__migration_ledger";

/// A record of an applied unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Unit name.
    pub migration_name: String,
    /// Checksum of the unit when it was applied.
    pub checksum: String,
    /// When the unit was applied.
    pub applied_at: DateTime<Utc>,
}

/// Reads and writes the ledger table.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE)
    }
}

impl Ledger {
    /// Creates a ledger stored in `table`.
    ///
    /// The name is used verbatim inside SQL; callers validate it (see
    /// [`crate::config::MigrateConfig::validate`]).
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Ledger table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.table)
    }

    /// Ensures the ledger table exists.
    pub async fn ensure_table(&self, conn: &mut SqliteConnection) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
    name TEXT PRIMARY KEY NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL
)",
            self.quoted()
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    /// Returns whether the ledger table exists.
    pub async fn exists(&self, conn: &mut SqliteConnection) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(&self.table)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.is_some())
    }

    /// Records a unit as applied.
    pub async fn record_applied(&self, conn: &mut SqliteConnection, unit: &MigrationUnit) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (name, checksum, applied_at) VALUES (?, ?, ?)",
            self.quoted()
        );
        sqlx::query(&sql)
            .bind(unit.name())
            .bind(unit.checksum()?)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Removes a unit's record (for rollback).
    pub async fn record_unapplied(&self, conn: &mut SqliteConnection, name: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE name = ?", self.quoted());
        let result = sqlx::query(&sql).bind(name).execute(&mut *conn).await?;

        if result.rows_affected() == 0 {
            return Err(MigrateError::UnknownMigration(name.to_string()));
        }

        Ok(())
    }

    /// Checks if a unit has been applied.
    pub async fn is_applied(&self, conn: &mut SqliteConnection, name: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE name = ?", self.quoted());
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row.is_some())
    }

    /// Gets all entries, ordered by name.
    pub async fn entries(&self, conn: &mut SqliteConnection) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT name, checksum, applied_at FROM {} ORDER BY name",
            self.quoted()
        );
        let rows: Vec<(String, String, String)> =
            sqlx::query_as(&sql).fetch_all(&mut *conn).await?;

        Ok(rows
            .into_iter()
            .map(|(migration_name, checksum, applied_at)| LedgerEntry {
                migration_name,
                checksum,
                applied_at: parse_applied_at(&applied_at),
            })
            .collect())
    }

    /// Gets the most recently applied entry.
    pub async fn last(&self, conn: &mut SqliteConnection) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT name, checksum, applied_at FROM {} ORDER BY name DESC LIMIT 1",
            self.quoted()
        );
        let row: Option<(String, String, String)> =
            sqlx::query_as(&sql).fetch_optional(&mut *conn).await?;

        Ok(row.map(|(migration_name, checksum, applied_at)| LedgerEntry {
            migration_name,
            checksum,
            applied_at: parse_applied_at(&applied_at),
        }))
    }

    /// Counts applied units.
    pub async fn count(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.quoted());
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(&mut *conn).await?;
        Ok(row.0)
    }
}

fn parse_applied_at(applied_at: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(applied_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime format fallback
            chrono::NaiveDateTime::parse_from_str(applied_at, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}

/// Checks that `entries` are exactly the first `entries.len()` of `units`.
///
/// `units` must already be sorted by name. Entry `i` has to name unit `i`
/// and carry its current checksum.
pub fn verify_prefix(entries: &[LedgerEntry], units: &[&MigrationUnit]) -> Result<()> {
    for (index, entry) in entries.iter().enumerate() {
        let unit = match units.get(index) {
            Some(unit) if unit.name() == entry.migration_name => unit,
            other => {
                return Err(MigrateError::OutOfOrderApplication {
                    expected: other.map(|u| u.name().to_string()),
                    found: entry.migration_name.clone(),
                });
            }
        };

        let current = unit.checksum()?;
        if current != entry.checksum {
            return Err(MigrateError::ChecksumMismatch {
                name: entry.migration_name.clone(),
                recorded: entry.checksum.clone(),
                current,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::Operation;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    fn unit(name: &str) -> MigrationUnit {
        MigrationUnit::new(name, vec![], vec![]).unwrap()
    }

    fn entry(unit: &MigrationUnit) -> LedgerEntry {
        LedgerEntry {
            migration_name: unit.name().to_string(),
            checksum: unit.checksum().unwrap(),
            applied_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ensure_table() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let ledger = Ledger::default();

        assert!(!ledger.exists(&mut conn).await.unwrap());
        ledger.ensure_table(&mut conn).await.unwrap();
        // Should be idempotent
        ledger.ensure_table(&mut conn).await.unwrap();
        assert!(ledger.exists(&mut conn).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_and_check_applied() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let ledger = Ledger::default();
        ledger.ensure_table(&mut conn).await.unwrap();

        let initial = unit("20180102093122_initial");
        assert!(!ledger.is_applied(&mut conn, initial.name()).await.unwrap());

        ledger.record_applied(&mut conn, &initial).await.unwrap();
        assert!(ledger.is_applied(&mut conn, initial.name()).await.unwrap());

        let again = ledger.record_applied(&mut conn, &initial).await;
        assert!(matches!(again, Err(MigrateError::Database(_))));
    }

    #[tokio::test]
    async fn test_entries_ordered_by_name() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let ledger = Ledger::new("schema_ledger");
        ledger.ensure_table(&mut conn).await.unwrap();

        for name in ["0002_seed", "0001_initial", "0003_slugs"] {
            ledger.record_applied(&mut conn, &unit(name)).await.unwrap();
        }

        let names: Vec<String> = ledger
            .entries(&mut conn)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.migration_name)
            .collect();
        assert_eq!(names, vec!["0001_initial", "0002_seed", "0003_slugs"]);

        let last = ledger.last(&mut conn).await.unwrap().unwrap();
        assert_eq!(last.migration_name, "0003_slugs");
        assert_eq!(ledger.count(&mut conn).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_record_unapplied() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let ledger = Ledger::default();
        ledger.ensure_table(&mut conn).await.unwrap();

        let initial = unit("0001_initial");
        ledger.record_applied(&mut conn, &initial).await.unwrap();
        ledger
            .record_unapplied(&mut conn, "0001_initial")
            .await
            .unwrap();
        assert!(ledger.last(&mut conn).await.unwrap().is_none());

        let missing = ledger.record_unapplied(&mut conn, "0001_initial").await;
        assert!(matches!(missing, Err(MigrateError::UnknownMigration(n)) if n == "0001_initial"));
    }

    #[tokio::test]
    async fn test_sqlite_datetime_fallback() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let ledger = Ledger::default();
        ledger.ensure_table(&mut conn).await.unwrap();

        sqlx::query(
            "INSERT INTO \"__migration_ledger\" VALUES ('0001_initial', 'abc', '2018-01-02 09:31:22')",
        )
        .execute(&mut *conn)
        .await
        .unwrap();

        let entry = ledger.last(&mut conn).await.unwrap().unwrap();
        assert_eq!(entry.applied_at.to_rfc3339(), "2018-01-02T09:31:22+00:00");
    }

    #[test]
    fn test_verify_prefix() {
        let a = unit("0001_a");
        let b = unit("0002_b");
        let units = vec![&a, &b];

        assert!(verify_prefix(&[], &units).is_ok());
        assert!(verify_prefix(&[entry(&a)], &units).is_ok());
        assert!(verify_prefix(&[entry(&a), entry(&b)], &units).is_ok());

        // Ledger skips a unit
        match verify_prefix(&[entry(&b)], &units) {
            Err(MigrateError::OutOfOrderApplication { expected, found }) => {
                assert_eq!(expected.as_deref(), Some("0001_a"));
                assert_eq!(found, "0002_b");
            }
            other => panic!("Expected OutOfOrderApplication, got {other:?}"),
        }

        // Ledger names a unit that is no longer known
        let c = unit("0003_c");
        match verify_prefix(&[entry(&a), entry(&b), entry(&c)], &units) {
            Err(MigrateError::OutOfOrderApplication { expected, found }) => {
                assert!(expected.is_none());
                assert_eq!(found, "0003_c");
            }
            other => panic!("Expected OutOfOrderApplication, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_prefix_detects_edits() {
        let a = unit("0001_a");
        let edited = MigrationUnit::new(
            "0001_a",
            vec![Operation::run_sql("SELECT 1", None)],
            vec![],
        )
        .unwrap();

        let result = verify_prefix(&[entry(&a)], &[&edited]);
        assert!(matches!(result, Err(MigrateError::ChecksumMismatch { name, .. }) if name == "0001_a"));
    }
}
