//! Database dialect implementations.
//!
//! Each dialect knows how to turn a migration [`Operation`] into SQL
//! statements for that database system.

mod sqlite;

use std::fmt;

pub use sqlite::SqliteDialect;

use crate::error::ExecutionError;
use crate::introspect::LiveTable;
use crate::operations::Operation;
use crate::schema::{ColumnSchema, SqlType};
use crate::value::SqlValue;

/// One SQL statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Parameters, in placeholder order.
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// A statement without parameters.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// A statement with parameters.
    #[must_use]
    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl fmt::Display for Statement {
    /// Renders the statement with parameters inlined, for previews.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            return f.write_str(&self.sql);
        }
        let mut params = self.params.iter().peekable();
        for ch in self.sql.chars() {
            match (ch, params.next_if(|_| ch == '?')) {
                (_, Some(param)) => write!(f, "{}", param)?,
                (ch, None) => write!(f, "{}", ch)?,
            }
        }
        Ok(())
    }
}

/// Trait for database-specific SQL generation.
pub trait MigrationDialect: Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Generates the statements for an operation.
    ///
    /// Operations the dialect can only perform by rebuilding a table (see
    /// [`MigrationDialect::supports_add_constraint`]) return
    /// [`ExecutionError::Unsupported`].
    fn generate_sql(&self, operation: &Operation) -> Result<Vec<Statement>, ExecutionError>;

    /// Generates the statements that recreate `table` with its current
    /// structure, keeping its rows and indexes.
    fn rebuild_table_sql(&self, table: &LiveTable) -> Vec<Statement>;

    /// Returns the SQL type name for the given type.
    fn type_name(&self, sql_type: &SqlType) -> String;

    /// Returns whether foreign keys can be added to or dropped from an
    /// existing table without rebuilding it.
    fn supports_add_constraint(&self) -> bool;

    /// Generates column definition SQL.
    fn column_definition(&self, column: &ColumnSchema) -> String {
        let mut parts = vec![
            self.quote_identifier(&column.name),
            self.type_name(&column.sql_type),
        ];

        if column.primary_key {
            parts.push("PRIMARY KEY".to_string());
            if column.auto_increment {
                parts.push(self.auto_increment_keyword().to_string());
            }
        }

        if !column.nullable && !column.primary_key {
            parts.push("NOT NULL".to_string());
        }

        if column.unique && !column.primary_key {
            parts.push("UNIQUE".to_string());
        }

        if let Some(default_sql) = column.default.to_sql() {
            parts.push(format!("DEFAULT {}", default_sql));
        }

        if let Some(ref check) = column.check {
            parts.push(format!("CHECK ({})", check));
        }

        parts.join(" ")
    }

    /// Returns the auto-increment keyword for this dialect.
    fn auto_increment_keyword(&self) -> &'static str;

    /// Quote an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Quote and join a list of identifiers.
    fn quote_list(&self, names: &[String]) -> String {
        names
            .iter()
            .map(|n| self.quote_identifier(n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
