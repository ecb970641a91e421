//! SQLite dialect for migrations.
//!
//! SQLite has limited ALTER TABLE support: foreign keys can only be
//! declared when a table is created. Adding or dropping one uses the
//! "table recreation" strategy: copy the rows out, drop the table,
//! create it again with the new definition, copy the rows back.

use crate::error::ExecutionError;
use crate::introspect::{LiveForeignKey, LiveTable};
use crate::operations::Operation;
use crate::schema::{ColumnSchema, ForeignKeySchema, SqlType};
use crate::value::SqlValue;

use super::{MigrationDialect, Statement};

/// Prefix of the scratch table used while rebuilding a table.
const REBUILD_PREFIX: &str = "__ledger_rebuild_";

/// SQLite migration dialect.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Generates SQL for creating a table.
    fn create_table_sql(
        &self,
        name: &str,
        columns: &[ColumnSchema],
        primary_key: &[String],
        foreign_keys: &[ForeignKeySchema],
    ) -> String {
        let mut sql = String::from("CREATE TABLE ");
        sql.push_str(&self.quote_identifier(name));
        sql.push_str(" (\n");

        // Column definitions
        let col_defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        sql.push_str("  ");
        sql.push_str(&col_defs.join(",\n  "));

        // Composite primary key (if more than one column or if not defined inline)
        let pk_columns: Vec<&String> = primary_key
            .iter()
            .filter(|pk| {
                columns
                    .iter()
                    .find(|c| &c.name == *pk)
                    .map(|c| !c.primary_key)
                    .unwrap_or(true)
            })
            .collect();

        if !pk_columns.is_empty() || primary_key.len() > 1 {
            sql.push_str(",\n  PRIMARY KEY (");
            sql.push_str(&self.quote_list(primary_key));
            sql.push(')');
        }

        for fk in foreign_keys {
            sql.push_str(",\n  ");
            if !fk.name.is_empty() {
                sql.push_str("CONSTRAINT ");
                sql.push_str(&self.quote_identifier(&fk.name));
                sql.push(' ');
            }
            sql.push_str(&self.foreign_key_clause(&LiveForeignKey::from(fk)));
        }

        sql.push_str("\n)");
        sql
    }

    /// `FOREIGN KEY (...) REFERENCES ... ON UPDATE ... ON DELETE ...`
    fn foreign_key_clause(&self, fk: &LiveForeignKey) -> String {
        let mut clause = format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            self.quote_list(&fk.columns),
            self.quote_identifier(&fk.references_table)
        );
        if !fk.references_columns.is_empty() {
            clause.push_str(&format!(" ({})", self.quote_list(&fk.references_columns)));
        }
        clause.push_str(&format!(
            " ON UPDATE {} ON DELETE {}",
            fk.on_update, fk.on_delete
        ));
        clause
    }

    /// Generates SQL for renaming a table.
    fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote_identifier(old_name),
            self.quote_identifier(new_name)
        )
    }

    /// Generates SQL for adding a column.
    fn add_column_sql(&self, table: &str, column: &ColumnSchema) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_identifier(table),
            self.column_definition(column)
        )
    }

    /// Generates SQL for dropping a column (SQLite 3.35.0+).
    fn drop_column_sql(&self, table: &str, column_name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_identifier(table),
            self.quote_identifier(column_name)
        )
    }

    /// Generates SQL for renaming a column (SQLite 3.25.0+).
    fn rename_column_sql(&self, table: &str, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote_identifier(table),
            self.quote_identifier(old_name),
            self.quote_identifier(new_name)
        )
    }

    /// Generates SQL for creating an index.
    fn create_index_sql(
        &self,
        name: &str,
        table: &str,
        columns: &[String],
        unique: bool,
        condition: Option<&str>,
    ) -> String {
        let mut sql = String::from("CREATE ");
        if unique {
            sql.push_str("UNIQUE ");
        }
        sql.push_str("INDEX ");
        sql.push_str(&self.quote_identifier(name));
        sql.push_str(" ON ");
        sql.push_str(&self.quote_identifier(table));
        sql.push_str(" (");
        sql.push_str(&self.quote_list(columns));
        sql.push(')');

        if let Some(cond) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(cond);
        }

        sql
    }

    fn insert_row_sql(
        &self,
        table: &str,
        columns: &[String],
        values: &[SqlValue],
    ) -> Result<Statement, ExecutionError> {
        check_row(table, columns, values)?;
        let placeholders = vec!["?"; values.len()].join(", ");
        Ok(Statement::with_params(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.quote_identifier(table),
                self.quote_list(columns),
                placeholders
            ),
            values.to_vec(),
        ))
    }

    fn update_row_sql(
        &self,
        table: &str,
        key_column: &str,
        key_value: &SqlValue,
        columns: &[String],
        values: &[SqlValue],
    ) -> Result<Statement, ExecutionError> {
        check_row(table, columns, values)?;
        let assignments: Vec<String> = columns
            .iter()
            .map(|c| format!("{} = ?", self.quote_identifier(c)))
            .collect();
        let mut params = values.to_vec();
        params.push(key_value.clone());
        Ok(Statement::with_params(
            format!(
                "UPDATE {} SET {} WHERE {} = ?",
                self.quote_identifier(table),
                assignments.join(", "),
                self.quote_identifier(key_column)
            ),
            params,
        ))
    }

    fn delete_row_sql(&self, table: &str, key_column: &str, key_value: &SqlValue) -> Statement {
        Statement::with_params(
            format!(
                "DELETE FROM {} WHERE {} = ?",
                self.quote_identifier(table),
                self.quote_identifier(key_column)
            ),
            vec![key_value.clone()],
        )
    }

    /// `CREATE TABLE` for a live table definition.
    fn live_create_table_sql(&self, table: &LiveTable) -> String {
        let pk = table.primary_key();
        let inline_pk = table.autoincrement && pk.len() == 1;

        let mut defs: Vec<String> = table
            .columns
            .iter()
            .map(|column| {
                let mut def = self.quote_identifier(&column.name);
                if !column.decl_type.is_empty() {
                    def.push(' ');
                    def.push_str(&column.decl_type);
                }
                if inline_pk && column.pk_position > 0 {
                    def.push_str(" PRIMARY KEY ");
                    def.push_str(self.auto_increment_keyword());
                }
                if column.not_null {
                    def.push_str(" NOT NULL");
                }
                if let Some(ref default_sql) = column.default_sql {
                    def.push_str(&format!(" DEFAULT ({})", default_sql));
                }
                def
            })
            .collect();

        if !inline_pk && !pk.is_empty() {
            let pk: Vec<String> = pk.into_iter().map(String::from).collect();
            defs.push(format!("PRIMARY KEY ({})", self.quote_list(&pk)));
        }
        for unique in &table.unique_constraints {
            defs.push(format!("UNIQUE ({})", self.quote_list(unique)));
        }
        for fk in &table.foreign_keys {
            defs.push(self.foreign_key_clause(fk));
        }

        format!(
            "CREATE TABLE {} (\n  {}\n)",
            self.quote_identifier(&table.name),
            defs.join(",\n  ")
        )
    }
}

/// Rejects seed rows whose column and value lists disagree.
fn check_row(table: &str, columns: &[String], values: &[SqlValue]) -> Result<(), ExecutionError> {
    if columns.is_empty() {
        return Err(ExecutionError::InvalidOperation(format!(
            "row operation on '{}' names no columns",
            table
        )));
    }
    if columns.len() != values.len() {
        return Err(ExecutionError::InvalidOperation(format!(
            "row operation on '{}' has {} column(s) but {} value(s)",
            table,
            columns.len(),
            values.len()
        )));
    }
    Ok(())
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn generate_sql(&self, operation: &Operation) -> Result<Vec<Statement>, ExecutionError> {
        let statement = match operation {
            Operation::CreateTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => Statement::new(self.create_table_sql(name, columns, primary_key, foreign_keys)),

            Operation::DropTable { name } => {
                Statement::new(format!("DROP TABLE {}", self.quote_identifier(name)))
            }

            Operation::RenameTable { old_name, new_name } => {
                Statement::new(self.rename_table_sql(old_name, new_name))
            }

            Operation::AddColumn { table, column } => {
                Statement::new(self.add_column_sql(table, column))
            }

            Operation::DropColumn { table, column_name } => {
                Statement::new(self.drop_column_sql(table, column_name))
            }

            Operation::RenameColumn {
                table,
                old_name,
                new_name,
            } => Statement::new(self.rename_column_sql(table, old_name, new_name)),

            Operation::CreateIndex {
                name,
                table,
                columns,
                unique,
                condition,
            } => Statement::new(self.create_index_sql(
                name,
                table,
                columns,
                *unique,
                condition.as_deref(),
            )),

            Operation::DropIndex { name } => {
                Statement::new(format!("DROP INDEX {}", self.quote_identifier(name)))
            }

            Operation::AddForeignKey { table, .. } | Operation::DropForeignKey { table, .. } => {
                return Err(ExecutionError::Unsupported(format!(
                    "changing foreign keys of '{}' requires a table rebuild in SQLite",
                    table
                )));
            }

            Operation::InsertRow {
                table,
                columns,
                values,
            } => self.insert_row_sql(table, columns, values)?,

            Operation::UpdateRow {
                table,
                key_column,
                key_value,
                columns,
                values,
            } => self.update_row_sql(table, key_column, key_value, columns, values)?,

            Operation::DeleteRow {
                table,
                key_column,
                key_value,
            } => self.delete_row_sql(table, key_column, key_value),

            Operation::RunSql { forward, .. } => Statement::new(forward.clone()),
        };
        Ok(vec![statement])
    }

    fn rebuild_table_sql(&self, table: &LiveTable) -> Vec<Statement> {
        let name = self.quote_identifier(&table.name);
        let scratch = self.quote_identifier(&format!("{}{}", REBUILD_PREFIX, table.name));
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let column_list = self.quote_list(&columns);

        let mut statements = vec![
            Statement::new("PRAGMA defer_foreign_keys = ON"),
            Statement::new(format!(
                "CREATE TEMP TABLE {} AS SELECT * FROM {}",
                scratch, name
            )),
            Statement::new(format!("DROP TABLE {}", name)),
            Statement::new(self.live_create_table_sql(table)),
            Statement::new(format!(
                "INSERT INTO {} ({}) SELECT {} FROM temp.{}",
                name, column_list, column_list, scratch
            )),
            Statement::new(format!("DROP TABLE temp.{}", scratch)),
        ];
        statements.extend(table.index_sql.iter().map(Statement::new));
        statements
    }

    fn type_name(&self, sql_type: &SqlType) -> String {
        match sql_type {
            SqlType::Integer | SqlType::SmallInt => "INTEGER".to_string(),
            SqlType::BigInt => "INTEGER".to_string(),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Varchar(_) => "TEXT".to_string(),
            SqlType::Char(_) => "TEXT".to_string(),
            SqlType::Boolean => "INTEGER".to_string(),
            SqlType::DateTime | SqlType::Timestamp => "TEXT".to_string(),
            SqlType::Date => "TEXT".to_string(),
            SqlType::Time => "TEXT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "REAL".to_string(),
            SqlType::Decimal(_, _) | SqlType::Numeric(_, _) => "NUMERIC".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Json => "TEXT".to_string(),
            SqlType::Uuid => "TEXT".to_string(),
        }
    }

    fn supports_add_constraint(&self) -> bool {
        false
    }

    fn auto_increment_keyword(&self) -> &'static str {
        "AUTOINCREMENT"
    }
}
