//! Runner configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::dialect::SqliteDialect;
use crate::error::{MigrateError, Result};
use crate::ledger::DEFAULT_LEDGER_TABLE;
use crate::runner::MigrationRunner;

/// Settings for connecting to a database and running migrations.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    /// SQLite connection URL.
    pub database_url: String,
    /// Directory holding `<timestamp>_<description>.json` units.
    pub migrations_dir: PathBuf,
    /// Ledger table name; the lock table is `<ledger_table>_lock`.
    pub ledger_table: String,
    /// Identity recorded in the lock while running.
    pub lock_holder: String,
    /// Pool size.
    pub max_connections: u32,
    /// How long SQLite waits on a locked database file.
    pub busy_timeout: Duration,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://db.sqlite3".to_string(),
            migrations_dir: PathBuf::from("migrations"),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            lock_holder: format!("pid:{}", std::process::id()),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl MigrateConfig {
    /// Checks values that end up inside SQL text or the pool.
    pub fn validate(&self) -> Result<()> {
        let table = &self.ledger_table;
        let plain = table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !plain {
            return Err(MigrateError::InvalidConfig(format!(
                "ledger table '{}' must be a plain identifier",
                table
            )));
        }
        if table.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(MigrateError::InvalidConfig(format!(
                "ledger table '{}' uses the reserved sqlite_ prefix",
                table
            )));
        }
        if self.lock_holder.trim().is_empty() {
            return Err(MigrateError::InvalidConfig(
                "lock holder must not be empty".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(MigrateError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Opens a pool, creating the database file if needed.
    pub async fn connect(&self) -> Result<SqlitePool> {
        self.validate()?;
        let options = SqliteConnectOptions::from_str(&self.database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    /// A runner over `pool` using this configuration's ledger and holder.
    #[must_use]
    pub fn runner(&self, pool: SqlitePool) -> MigrationRunner<SqliteDialect> {
        MigrationRunner::new(pool, SqliteDialect::new())
            .ledger_table(&self.ledger_table)
            .lock_holder(self.lock_holder.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MigrateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger_table, "__migration_ledger");
        assert!(config.lock_holder.starts_with("pid:"));
    }

    #[test]
    fn test_ledger_table_must_be_identifier() {
        for bad in ["", "1ledger", "ledger; DROP TABLE Themes", "my-ledger", "sqlite_ledger"] {
            let config = MigrateConfig {
                ledger_table: bad.to_string(),
                ..MigrateConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(MigrateError::InvalidConfig(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_connect_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publications.sqlite3");
        let config = MigrateConfig {
            database_url: format!("sqlite://{}", path.display()),
            ..MigrateConfig::default()
        };

        let pool = config.connect().await.unwrap();
        config.runner(pool).init().await.unwrap();
        assert!(path.exists());
    }
}
