//! Migration operations.
//!
//! This module defines every schema or seed-row change a migration unit can
//! contain, along with the mechanical inverse of each where one exists.

use serde::{Deserialize, Serialize};

use crate::schema::{ColumnSchema, ForeignKeyAction, ForeignKeySchema};
use crate::value::SqlValue;

/// A single migration operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a new table.
    CreateTable {
        /// Table name.
        name: String,
        /// Column definitions.
        columns: Vec<ColumnSchema>,
        /// Primary key column(s).
        #[serde(default)]
        primary_key: Vec<String>,
        /// Foreign keys declared with the table.
        #[serde(default)]
        foreign_keys: Vec<ForeignKeySchema>,
    },

    /// Drop a table.
    DropTable {
        /// Table name.
        name: String,
    },

    /// Rename a table.
    RenameTable {
        /// Old table name.
        old_name: String,
        /// New table name.
        new_name: String,
    },

    /// Add a column to a table.
    AddColumn {
        /// Table name.
        table: String,
        /// Column definition.
        column: ColumnSchema,
    },

    /// Drop a column from a table.
    DropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column_name: String,
    },

    /// Rename a column.
    RenameColumn {
        /// Table name.
        table: String,
        /// Old column name.
        old_name: String,
        /// New column name.
        new_name: String,
    },

    /// Create an index.
    CreateIndex {
        /// Index name.
        name: String,
        /// Table name.
        table: String,
        /// Columns to index.
        columns: Vec<String>,
        /// Whether this is a unique index.
        #[serde(default)]
        unique: bool,
        /// Partial index condition.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },

    /// Drop an index.
    DropIndex {
        /// Index name.
        name: String,
    },

    /// Add a foreign key constraint to an existing table.
    AddForeignKey {
        /// Table name.
        table: String,
        /// Foreign key definition.
        foreign_key: ForeignKeySchema,
    },

    /// Drop the foreign key declared on the given columns.
    DropForeignKey {
        /// Table name.
        table: String,
        /// Local columns of the foreign key.
        columns: Vec<String>,
    },

    /// Insert one seed row.
    InsertRow {
        /// Table name.
        table: String,
        /// Column names, parallel to `values`.
        columns: Vec<String>,
        /// Literal values.
        values: Vec<SqlValue>,
    },

    /// Update the row identified by `key_column = key_value`.
    UpdateRow {
        /// Table name.
        table: String,
        /// Key column.
        key_column: String,
        /// Key value.
        key_value: SqlValue,
        /// Columns to set, parallel to `values`.
        columns: Vec<String>,
        /// New values.
        values: Vec<SqlValue>,
    },

    /// Delete the row identified by `key_column = key_value`.
    DeleteRow {
        /// Table name.
        table: String,
        /// Key column.
        key_column: String,
        /// Key value.
        key_value: SqlValue,
    },

    /// Run raw SQL (for custom migrations).
    RunSql {
        /// Forward SQL statement.
        forward: String,
        /// Backward SQL statement for rollback.
        #[serde(default)]
        backward: Option<String>,
    },
}

impl Operation {
    /// Creates a CreateTable operation without foreign keys.
    #[must_use]
    pub fn create_table(
        name: impl Into<String>,
        columns: Vec<ColumnSchema>,
        primary_key: Vec<String>,
    ) -> Self {
        Self::CreateTable {
            name: name.into(),
            columns,
            primary_key,
            foreign_keys: Vec::new(),
        }
    }

    /// Creates a DropTable operation.
    #[must_use]
    pub fn drop_table(name: impl Into<String>) -> Self {
        Self::DropTable { name: name.into() }
    }

    /// Creates a RenameTable operation.
    #[must_use]
    pub fn rename_table(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self::RenameTable {
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    /// Creates an AddColumn operation.
    #[must_use]
    pub fn add_column(table: impl Into<String>, column: ColumnSchema) -> Self {
        Self::AddColumn {
            table: table.into(),
            column,
        }
    }

    /// Creates a DropColumn operation.
    #[must_use]
    pub fn drop_column(table: impl Into<String>, column_name: impl Into<String>) -> Self {
        Self::DropColumn {
            table: table.into(),
            column_name: column_name.into(),
        }
    }

    /// Creates a RenameColumn operation.
    #[must_use]
    pub fn rename_column(
        table: impl Into<String>,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        Self::RenameColumn {
            table: table.into(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    /// Creates a CreateIndex operation.
    #[must_use]
    pub fn create_index(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        unique: bool,
    ) -> Self {
        Self::CreateIndex {
            name: name.into(),
            table: table.into(),
            columns,
            unique,
            condition: None,
        }
    }

    /// Creates a DropIndex operation.
    #[must_use]
    pub fn drop_index(name: impl Into<String>) -> Self {
        Self::DropIndex { name: name.into() }
    }

    /// Creates an AddForeignKey operation.
    #[must_use]
    pub fn add_foreign_key(table: impl Into<String>, foreign_key: ForeignKeySchema) -> Self {
        Self::AddForeignKey {
            table: table.into(),
            foreign_key,
        }
    }

    /// Creates a DropForeignKey operation.
    #[must_use]
    pub fn drop_foreign_key(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self::DropForeignKey {
            table: table.into(),
            columns,
        }
    }

    /// Creates an InsertRow operation from `(column, value)` pairs.
    #[must_use]
    pub fn insert_row<C, V>(table: impl Into<String>, row: impl IntoIterator<Item = (C, V)>) -> Self
    where
        C: Into<String>,
        V: Into<SqlValue>,
    {
        let (columns, values) = row
            .into_iter()
            .map(|(c, v)| (c.into(), v.into()))
            .unzip();
        Self::InsertRow {
            table: table.into(),
            columns,
            values,
        }
    }

    /// Creates an UpdateRow operation from `(column, value)` pairs.
    #[must_use]
    pub fn update_row<C, V>(
        table: impl Into<String>,
        key_column: impl Into<String>,
        key_value: impl Into<SqlValue>,
        row: impl IntoIterator<Item = (C, V)>,
    ) -> Self
    where
        C: Into<String>,
        V: Into<SqlValue>,
    {
        let (columns, values) = row
            .into_iter()
            .map(|(c, v)| (c.into(), v.into()))
            .unzip();
        Self::UpdateRow {
            table: table.into(),
            key_column: key_column.into(),
            key_value: key_value.into(),
            columns,
            values,
        }
    }

    /// Creates a DeleteRow operation.
    #[must_use]
    pub fn delete_row(
        table: impl Into<String>,
        key_column: impl Into<String>,
        key_value: impl Into<SqlValue>,
    ) -> Self {
        Self::DeleteRow {
            table: table.into(),
            key_column: key_column.into(),
            key_value: key_value.into(),
        }
    }

    /// Creates a RunSql operation.
    #[must_use]
    pub fn run_sql(forward: impl Into<String>, backward: Option<String>) -> Self {
        Self::RunSql {
            forward: forward.into(),
            backward,
        }
    }

    /// Returns the reverse operation for rollback.
    ///
    /// Returns `None` if the inverse needs information the operation does not
    /// carry (dropped definitions, overwritten row values).
    #[must_use]
    pub fn reverse(&self) -> Option<Self> {
        match self {
            Self::CreateTable { name, .. } => Some(Self::drop_table(name.clone())),

            Self::RenameTable { old_name, new_name } => {
                Some(Self::rename_table(new_name.clone(), old_name.clone()))
            }

            Self::AddColumn { table, column } => {
                Some(Self::drop_column(table.clone(), column.name.clone()))
            }

            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => Some(Self::rename_column(
                table.clone(),
                new_name.clone(),
                old_name.clone(),
            )),

            Self::CreateIndex { name, .. } => Some(Self::drop_index(name.clone())),

            Self::AddForeignKey { table, foreign_key } => Some(Self::drop_foreign_key(
                table.clone(),
                foreign_key.columns.clone(),
            )),

            // The first column is taken to be the row key.
            Self::InsertRow {
                table,
                columns,
                values,
            } => match (columns.first(), values.first()) {
                (Some(key_column), Some(key_value)) => Some(Self::delete_row(
                    table.clone(),
                    key_column.clone(),
                    key_value.clone(),
                )),
                _ => None,
            },

            Self::RunSql { backward, forward } => backward.as_ref().map(|bwd| Self::RunSql {
                forward: bwd.clone(),
                backward: Some(forward.clone()),
            }),

            Self::DropTable { .. }
            | Self::DropColumn { .. }
            | Self::DropIndex { .. }
            | Self::DropForeignKey { .. }
            | Self::UpdateRow { .. }
            | Self::DeleteRow { .. } => None,
        }
    }

    /// Returns a human-readable description of this operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::CreateTable { name, .. } => format!("Create table '{}'", name),
            Self::DropTable { name } => format!("Drop table '{}'", name),
            Self::RenameTable { old_name, new_name } => {
                format!("Rename table '{}' to '{}'", old_name, new_name)
            }
            Self::AddColumn { table, column } => {
                format!("Add column '{}' to table '{}'", column.name, table)
            }
            Self::DropColumn { table, column_name } => {
                format!("Drop column '{}' from table '{}'", column_name, table)
            }
            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => format!(
                "Rename column '{}' to '{}' in table '{}'",
                old_name, new_name, table
            ),
            Self::CreateIndex { name, table, .. } => {
                format!("Create index '{}' on table '{}'", name, table)
            }
            Self::DropIndex { name } => format!("Drop index '{}'", name),
            Self::AddForeignKey { table, foreign_key } => format!(
                "Add foreign key ({}) -> '{}' to table '{}'",
                foreign_key.columns.join(", "),
                foreign_key.references_table,
                table
            ),
            Self::DropForeignKey { table, columns } => format!(
                "Drop foreign key ({}) from table '{}'",
                columns.join(", "),
                table
            ),
            Self::InsertRow { table, values, .. } => match values.first() {
                Some(key) => format!("Insert row {} into '{}'", key, table),
                None => format!("Insert row into '{}'", table),
            },
            Self::UpdateRow {
                table,
                key_column,
                key_value,
                ..
            } => format!(
                "Update row {} = {} in '{}'",
                key_column, key_value, table
            ),
            Self::DeleteRow {
                table,
                key_column,
                key_value,
            } => format!(
                "Delete row {} = {} from '{}'",
                key_column, key_value, table
            ),
            Self::RunSql { .. } => "Run custom SQL".to_string(),
        }
    }
}

/// Builder for foreign key schema.
pub struct ForeignKeyBuilder {
    schema: ForeignKeySchema,
}

impl ForeignKeyBuilder {
    /// Creates a new foreign key builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: ForeignKeySchema {
                name: name.into(),
                columns: Vec::new(),
                references_table: String::new(),
                references_columns: Vec::new(),
                on_delete: ForeignKeyAction::NoAction,
                on_update: ForeignKeyAction::NoAction,
            },
        }
    }

    /// Sets the local columns.
    #[must_use]
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.schema.columns = columns;
        self
    }

    /// Sets the referenced table and columns.
    #[must_use]
    pub fn references(mut self, table: impl Into<String>, columns: Vec<String>) -> Self {
        self.schema.references_table = table.into();
        self.schema.references_columns = columns;
        self
    }

    /// Sets the ON DELETE action.
    #[must_use]
    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.schema.on_delete = action;
        self
    }

    /// Sets the ON UPDATE action.
    #[must_use]
    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.schema.on_update = action;
        self
    }

    /// Builds the foreign key schema.
    #[must_use]
    pub fn build(self) -> ForeignKeySchema {
        self.schema
    }
}
