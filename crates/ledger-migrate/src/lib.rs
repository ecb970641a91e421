//! Ledger-tracked, reversible schema and seed-data migrations for SQLite.
//!
//! `ledger-migrate` applies named migration units to a database and records
//! each applied unit in a ledger table stored in that same database:
//! - Units are `<timestamp>_<description>` pairs of forward and reverse
//!   operation lists, applied strictly in name order
//! - Each unit runs in its own transaction together with its ledger write
//! - An advisory lock keeps two runners from applying the same unit twice
//! - Failures are never skipped or retried; they name the unit and operation
//!
//! # Architecture
//!
//! - **Operations** - Schema changes (`CreateTable`, `AddColumn`,
//!   `AddForeignKey`, ...) and seed rows (`InsertRow`, `UpdateRow`, `DeleteRow`)
//! - **Units** - Named forward/reverse operation lists, from data files or code
//! - **Executor** - Runs one operation through a dialect
//! - **Ledger** - The applied-units table, and its lock
//! - **Runner** - Applies pending units and rolls back applied ones
//! - **State** - Replays units in memory to check them without a database
//!
//! # Example
//!
//! ```rust,ignore
//! use ledger_migrate::prelude::*;
//!
//! let units = vec![
//!     MigrationUnit::auto_reversed(
//!         "20180102093122_initial",
//!         vec![Operation::create_table(
//!             "Themes",
//!             vec![
//!                 ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
//!                 ColumnSchema::new("Title", SqlType::Text).not_null(),
//!             ],
//!             vec!["Id".to_string()],
//!         )],
//!     )?,
//!     MigrationUnit::auto_reversed(
//!         "20180102094517_seed_themes",
//!         vec![Operation::insert_row(
//!             "Themes",
//!             [("Id", "cc8e02fd-5599-41aa-940d-26bca68eab53"), ("Title", "Science")],
//!         )],
//!     )?,
//! ];
//!
//! let runner = MigrationRunner::new(pool, SqliteDialect::new());
//! let applied = runner.apply_pending(&units, None).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Apply pending units from ./migrations
//! migrate --database sqlite://stats.db up
//!
//! # Roll back the last two units
//! migrate down --steps 2
//!
//! # Show applied and pending units
//! migrate status
//! ```

pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod introspect;
pub mod ledger;
pub mod loader;
pub mod lock;
pub mod operations;
pub mod runner;
pub mod schema;
pub mod state;
pub mod unit;
pub mod value;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::MigrateConfig;
    pub use crate::dialect::{MigrationDialect, SqliteDialect, Statement};
    pub use crate::error::{ExecutionError, MigrateError, Result};
    pub use crate::executor::OperationExecutor;
    pub use crate::ledger::{Ledger, LedgerEntry};
    pub use crate::loader::{load_dir, write_new_unit};
    pub use crate::lock::{LedgerLock, LockHolder};
    pub use crate::operations::{ForeignKeyBuilder, Operation};
    pub use crate::runner::{MigrationRunner, PlannedUnit, UnitState, UnitStatus};
    pub use crate::schema::{
        ColumnSchema, DatabaseSchema, DefaultValue, ForeignKeyAction, ForeignKeySchema,
        IndexSchema, SqlType, TableSchema,
    };
    pub use crate::state::{check_units, SchemaState};
    pub use crate::unit::{Direction, LedgerMigration, MigrationUnit};
    pub use crate::value::SqlValue;
}
