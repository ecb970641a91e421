//! State reconstruction from migration units.
//!
//! This module reconstructs the expected database schema by replaying
//! operations without touching a database. `migrate check` uses it to catch
//! units whose operations cannot apply in order, or whose reverse list does
//! not undo the forward list, before anything runs for real.

use crate::error::{MigrateError, Result};
use crate::operations::Operation;
use crate::schema::{DatabaseSchema, IndexSchema, TableSchema};
use crate::unit::{ordered, Direction, MigrationUnit};

/// Reconstructs database schema from a list of operations.
#[derive(Debug, Default)]
pub struct SchemaState {
    schema: DatabaseSchema,
}

fn missing_table(name: &str) -> MigrateError {
    MigrateError::InvalidState(format!("Table '{}' does not exist", name))
}

fn missing_column(column: &str, table: &str) -> MigrateError {
    MigrateError::InvalidState(format!(
        "Column '{}' does not exist in table '{}'",
        column, table
    ))
}

fn require_columns<'a>(
    table: &TableSchema,
    columns: impl IntoIterator<Item = &'a String>,
) -> Result<()> {
    for column in columns {
        if table.get_column(column).is_none() {
            return Err(missing_column(column, &table.name));
        }
    }
    Ok(())
}

impl SchemaState {
    /// Creates a new empty schema state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current schema.
    #[must_use]
    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    /// Consumes and returns the schema.
    #[must_use]
    pub fn into_schema(self) -> DatabaseSchema {
        self.schema
    }

    fn table(&self, name: &str) -> Result<&TableSchema> {
        self.schema.get_table(name).ok_or_else(|| missing_table(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableSchema> {
        self.schema
            .get_table_mut(name)
            .ok_or_else(|| missing_table(name))
    }

    /// Applies one direction of a unit to the schema state.
    ///
    /// Errors name the unit and the index of the failing operation.
    pub fn apply_unit(&mut self, unit: &MigrationUnit, direction: Direction) -> Result<()> {
        for (index, operation) in unit.operations(direction).iter().enumerate() {
            self.apply_operation(operation).map_err(|e| match e {
                MigrateError::InvalidState(message) => MigrateError::InvalidState(format!(
                    "'{}' {} operation {}: {}",
                    unit.name(),
                    match direction {
                        Direction::Forward => "forward",
                        Direction::Reverse => "reverse",
                    },
                    index,
                    message
                )),
                other => other,
            })?;
        }
        Ok(())
    }

    /// Applies a single operation to the schema state.
    pub fn apply_operation(&mut self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::CreateTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => {
                if self.schema.get_table(name).is_some() {
                    return Err(MigrateError::InvalidState(format!(
                        "Table '{}' already exists",
                        name
                    )));
                }

                let table = TableSchema {
                    name: name.clone(),
                    columns: columns.clone(),
                    primary_key: primary_key.clone(),
                    indexes: Vec::new(),
                    foreign_keys: foreign_keys.clone(),
                };
                require_columns(&table, table.primary_key.iter())?;
                for fk in &table.foreign_keys {
                    require_columns(&table, fk.columns.iter())?;
                }
                self.schema.tables.push(table);
            }

            Operation::DropTable { name } => {
                let idx = self
                    .schema
                    .tables
                    .iter()
                    .position(|t| t.name == *name)
                    .ok_or_else(|| missing_table(name))?;
                self.schema.tables.remove(idx);
            }

            Operation::RenameTable { old_name, new_name } => {
                if self.schema.get_table(new_name).is_some() {
                    return Err(MigrateError::InvalidState(format!(
                        "Table '{}' already exists",
                        new_name
                    )));
                }
                self.table_mut(old_name)?.name = new_name.clone();
                // SQLite rewrites references held by other tables.
                for t in &mut self.schema.tables {
                    for fk in &mut t.foreign_keys {
                        if fk.references_table == *old_name {
                            fk.references_table = new_name.clone();
                        }
                    }
                }
            }

            Operation::AddColumn { table, column } => {
                let t = self.table_mut(table)?;

                if t.get_column(&column.name).is_some() {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{}' already exists in table '{}'",
                        column.name, table
                    )));
                }
                if column.primary_key || column.unique {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{}' cannot be added to '{}' as PRIMARY KEY or UNIQUE",
                        column.name, table
                    )));
                }

                t.columns.push(column.clone());
            }

            Operation::DropColumn { table, column_name } => {
                let t = self.table_mut(table)?;

                let idx = t
                    .columns
                    .iter()
                    .position(|c| c.name == *column_name)
                    .ok_or_else(|| missing_column(column_name, table))?;

                let in_use = t.primary_key.contains(column_name)
                    || t.indexes.iter().any(|i| i.columns.contains(column_name))
                    || t.foreign_keys.iter().any(|fk| fk.columns.contains(column_name));
                if in_use {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{}' of table '{}' is used by a key or index",
                        column_name, table
                    )));
                }
                t.columns.remove(idx);
            }

            Operation::RenameColumn {
                table,
                old_name,
                new_name,
            } => {
                let t = self.table_mut(table)?;
                if t.get_column(new_name).is_some() {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{}' already exists in table '{}'",
                        new_name, table
                    )));
                }

                let col = t
                    .get_column_mut(old_name)
                    .ok_or_else(|| missing_column(old_name, table))?;
                col.name = new_name.clone();

                let rename = |c: &mut String| {
                    if *c == *old_name {
                        *c = new_name.clone();
                    }
                };
                t.primary_key.iter_mut().for_each(rename);
                for index in &mut t.indexes {
                    index.columns.iter_mut().for_each(rename);
                }
                for fk in &mut t.foreign_keys {
                    fk.columns.iter_mut().for_each(rename);
                }
                let table_name = t.name.clone();
                for other in &mut self.schema.tables {
                    for fk in &mut other.foreign_keys {
                        if fk.references_table == table_name {
                            fk.references_columns.iter_mut().for_each(rename);
                        }
                    }
                }
            }

            Operation::CreateIndex {
                name,
                table,
                columns,
                unique,
                condition,
            } => {
                if self
                    .schema
                    .tables
                    .iter()
                    .any(|t| t.indexes.iter().any(|i| i.name == *name))
                {
                    return Err(MigrateError::InvalidState(format!(
                        "Index '{}' already exists",
                        name
                    )));
                }

                let t = self.table_mut(table)?;
                require_columns(t, columns.iter())?;
                t.indexes.push(IndexSchema {
                    name: name.clone(),
                    columns: columns.clone(),
                    unique: *unique,
                    condition: condition.clone(),
                });
            }

            Operation::DropIndex { name } => {
                let mut found = false;
                for t in &mut self.schema.tables {
                    if let Some(idx) = t.indexes.iter().position(|i| i.name == *name) {
                        t.indexes.remove(idx);
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(MigrateError::InvalidState(format!(
                        "Index '{}' does not exist",
                        name
                    )));
                }
            }

            Operation::AddForeignKey { table, foreign_key } => {
                let parent = self.table(&foreign_key.references_table)?;
                require_columns(parent, foreign_key.references_columns.iter())?;

                let t = self.table_mut(table)?;
                require_columns(t, foreign_key.columns.iter())?;
                if t
                    .foreign_keys
                    .iter()
                    .any(|fk| fk.columns == foreign_key.columns)
                {
                    return Err(MigrateError::InvalidState(format!(
                        "Table '{}' already has a foreign key on ({})",
                        table,
                        foreign_key.columns.join(", ")
                    )));
                }

                t.foreign_keys.push(foreign_key.clone());
            }

            Operation::DropForeignKey { table, columns } => {
                let t = self.table_mut(table)?;

                let idx = t
                    .foreign_keys
                    .iter()
                    .position(|fk| fk.columns == *columns)
                    .ok_or_else(|| {
                        MigrateError::InvalidState(format!(
                            "No foreign key on ({}) in table '{}'",
                            columns.join(", "),
                            table
                        ))
                    })?;
                t.foreign_keys.remove(idx);
            }

            Operation::InsertRow {
                table,
                columns,
                values,
            }
            | Operation::UpdateRow {
                table,
                columns,
                values,
                ..
            } => {
                let t = self.table(table)?;
                if columns.is_empty() || columns.len() != values.len() {
                    return Err(MigrateError::InvalidState(format!(
                        "Row for '{}' has {} column(s) and {} value(s)",
                        table,
                        columns.len(),
                        values.len()
                    )));
                }
                require_columns(t, columns.iter())?;
                if let Operation::UpdateRow { key_column, .. } = operation {
                    require_columns(t, std::iter::once(key_column))?;
                }
            }

            Operation::DeleteRow {
                table, key_column, ..
            } => {
                let t = self.table(table)?;
                require_columns(t, std::iter::once(key_column))?;
            }

            Operation::RunSql { .. } => {
                // Raw SQL doesn't affect the tracked schema state
            }
        }

        Ok(())
    }

    /// Reconstructs the schema produced by applying `units` in order.
    pub fn from_units(units: &[MigrationUnit]) -> Result<Self> {
        let mut state = Self::new();
        for unit in ordered(units)? {
            state.apply_unit(unit, Direction::Forward)?;
        }
        Ok(state)
    }
}

/// Replays every unit forward, and its reverse list against a copy, checking
/// that each reverse list restores the schema that preceded the unit.
///
/// Returns the final schema. Stops at the first unit whose operations do not
/// apply; round-trip mismatches are collected and reported together.
pub fn check_units(units: &[MigrationUnit]) -> Result<DatabaseSchema> {
    let mut state = SchemaState::new();
    let mut mismatches = Vec::new();

    for unit in ordered(units)? {
        let before = state.schema().normalized();
        state.apply_unit(unit, Direction::Forward)?;

        let mut reversed = SchemaState {
            schema: state.schema().clone(),
        };
        reversed.apply_unit(unit, Direction::Reverse)?;

        if reversed.schema().normalized() != before {
            mismatches.push(MigrateError::RoundTripMismatch {
                unit_name: unit.name().to_string(),
                detail: "reverse operations do not restore the prior schema".to_string(),
            });
        }
    }

    match mismatches.len() {
        0 => Ok(state.into_schema()),
        1 => Err(mismatches.remove(0)),
        _ => Err(MigrateError::Multiple(mismatches)),
    }
}
