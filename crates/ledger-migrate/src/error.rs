//! Error types for the migration system.

use std::path::PathBuf;

/// Errors raised while executing a single operation against the database.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The database rejected a statement.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The operation itself is malformed.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An update or delete keyed on a value matched no row.
    #[error("no row in '{table}' where {key_column} = {key_value}")]
    NoMatchingRow {
        /// Table name.
        table: String,
        /// Key column used to locate the row.
        key_column: String,
        /// Rendered key value.
        key_value: String,
    },

    /// The operation targets a table that does not exist.
    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    /// No foreign key on the given columns exists.
    #[error("no foreign key on ({}) in table '{table}'", .columns.join(", "))]
    ForeignKeyNotFound {
        /// Table name.
        table: String,
        /// Local columns of the missing foreign key.
        columns: Vec<String>,
    },

    /// Existing rows violate a foreign key after a table rebuild.
    #[error("{count} row(s) in '{table}' violate a foreign key constraint")]
    ForeignKeyViolation {
        /// Table name.
        table: String,
        /// Number of violating rows.
        count: usize,
    },

    /// The dialect cannot express this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Two known units share a name.
    #[error("Duplicate migration name: {0}")]
    DuplicateMigrationName(String),

    /// A unit name is not of the form `<timestamp>_<description>`.
    #[error("Invalid migration name '{name}': {reason}")]
    InvalidMigrationName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The ledger is not a prefix of the known units.
    #[error(
        "Ledger out of order: found '{found}' where {} was expected",
        .expected.as_deref().map_or_else(|| "no entry".to_string(), |e| format!("'{e}'"))
    )]
    OutOfOrderApplication {
        /// The unit expected at this ledger position, if any.
        expected: Option<String>,
        /// The ledger entry actually found there.
        found: String,
    },

    /// An operation failed while applying or rolling back a unit.
    #[error("Migration '{unit_name}' failed at operation {operation_index}: {cause}")]
    OperationExecutionFailure {
        /// The unit whose transaction was aborted.
        unit_name: String,
        /// Zero-based index of the failing operation.
        operation_index: usize,
        /// Underlying failure.
        #[source]
        cause: ExecutionError,
    },

    /// A unit's operations succeeded but its ledger write or commit failed.
    #[error("Migration '{unit_name}' failed to commit: {cause}")]
    UnitCommitFailure {
        /// The unit whose transaction was aborted.
        unit_name: String,
        /// Underlying failure.
        #[source]
        cause: Box<MigrateError>,
    },

    /// Another runner holds the ledger lock.
    #[error("Ledger is locked by '{holder}' since {since}")]
    LockContention {
        /// Holder recorded in the lock row.
        holder: String,
        /// When the lock was taken.
        since: String,
    },

    /// An applied unit was edited after it was applied.
    #[error("Migration '{name}' changed after it was applied (ledger {recorded}, now {current})")]
    ChecksumMismatch {
        /// Unit name.
        name: String,
        /// Checksum stored in the ledger.
        recorded: String,
        /// Checksum of the unit as currently defined.
        current: String,
    },

    /// A name was given that matches no known unit or ledger entry.
    #[error("Migration not found: {0}")]
    UnknownMigration(String),

    /// A unit's reverse operations could not be derived.
    #[error("Migration '{0}' is not reversible")]
    NotReversible(String),

    /// Applying a unit's reverse operations did not restore the prior state.
    #[error("Migration '{unit_name}' does not round-trip: {detail}")]
    RoundTripMismatch {
        /// Unit name.
        unit_name: String,
        /// What differed.
        detail: String,
    },

    /// Invalid migration state.
    #[error("Invalid migration state: {0}")]
    InvalidState(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Database error outside of a unit's operations.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading/writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse migration file.
    #[error("Failed to parse migration file '{path}': {message}")]
    ParseError {
        /// Path to the migration file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Migration file already exists.
    #[error("Migration file already exists: {0}")]
    MigrationExists(PathBuf),

    /// No migrations directory found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Multiple errors occurred.
    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<MigrateError>),
}

impl MigrateError {
    /// Name of the unit this error is attributed to, if any.
    #[must_use]
    pub fn unit_name(&self) -> Option<&str> {
        match self {
            Self::OperationExecutionFailure { unit_name, .. }
            | Self::UnitCommitFailure { unit_name, .. }
            | Self::RoundTripMismatch { unit_name, .. } => Some(unit_name),
            Self::DuplicateMigrationName(name)
            | Self::NotReversible(name)
            | Self::UnknownMigration(name)
            | Self::ChecksumMismatch { name, .. }
            | Self::InvalidMigrationName { name, .. } => Some(name),
            Self::OutOfOrderApplication { found, .. } => Some(found),
            _ => None,
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
