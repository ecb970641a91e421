//! Operation executor.
//!
//! This module runs single migration operations against a database
//! connection. It never commits: callers hand it a connection that is
//! already inside the unit's transaction.

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqliteQueryResult};
use tracing::{debug, trace};

use crate::dialect::{MigrationDialect, Statement};
use crate::error::ExecutionError;
use crate::introspect::{self, LiveForeignKey, LiveTable};
use crate::operations::Operation;
use crate::schema::ForeignKeySchema;
use crate::value::SqlValue;

/// Executes operations through a dialect.
#[derive(Debug, Clone, Default)]
pub struct OperationExecutor<D: MigrationDialect> {
    dialect: D,
}

impl<D: MigrationDialect> OperationExecutor<D> {
    /// Creates a new executor.
    pub fn new(dialect: D) -> Self {
        Self { dialect }
    }

    /// Returns the dialect.
    #[must_use]
    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Executes one operation.
    ///
    /// Every operation fails if its precondition does not hold: creating
    /// something that exists, dropping or changing something that does not,
    /// and updating or deleting a row whose key matches nothing.
    pub async fn execute(
        &self,
        conn: &mut SqliteConnection,
        operation: &Operation,
    ) -> Result<(), ExecutionError> {
        debug!(operation = %operation.description(), "Executing operation");

        match operation {
            Operation::AddForeignKey { table, foreign_key }
                if !self.dialect.supports_add_constraint() =>
            {
                return self.add_foreign_key(conn, table, foreign_key).await;
            }
            Operation::DropForeignKey { table, columns }
                if !self.dialect.supports_add_constraint() =>
            {
                return self.drop_foreign_key(conn, table, columns).await;
            }
            _ => {}
        }

        let mut affected = 0;
        for statement in self.dialect.generate_sql(operation)? {
            affected = run(conn, &statement).await?.rows_affected();
        }

        match operation {
            Operation::UpdateRow {
                table,
                key_column,
                key_value,
                ..
            }
            | Operation::DeleteRow {
                table,
                key_column,
                key_value,
            } if affected == 0 => Err(ExecutionError::NoMatchingRow {
                table: table.clone(),
                key_column: key_column.clone(),
                key_value: key_value.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Renders the SQL an operation would run, parameters inlined.
    ///
    /// Table rebuilds depend on the live table, so they are described
    /// rather than rendered.
    pub fn preview(&self, operation: &Operation) -> Result<Vec<String>, ExecutionError> {
        if !self.dialect.supports_add_constraint() {
            match operation {
                Operation::AddForeignKey { table, foreign_key } => {
                    return Ok(vec![format!(
                        "-- rebuild {} adding FOREIGN KEY ({}) REFERENCES {} ({})",
                        self.dialect.quote_identifier(table),
                        self.dialect.quote_list(&foreign_key.columns),
                        self.dialect.quote_identifier(&foreign_key.references_table),
                        self.dialect.quote_list(&foreign_key.references_columns)
                    )]);
                }
                Operation::DropForeignKey { table, columns } => {
                    return Ok(vec![format!(
                        "-- rebuild {} dropping FOREIGN KEY ({})",
                        self.dialect.quote_identifier(table),
                        self.dialect.quote_list(columns)
                    )]);
                }
                _ => {}
            }
        }
        Ok(self
            .dialect
            .generate_sql(operation)?
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    async fn add_foreign_key(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        foreign_key: &ForeignKeySchema,
    ) -> Result<(), ExecutionError> {
        let mut live = rebuildable_table(conn, table).await?;

        if foreign_key.columns.is_empty()
            || foreign_key.columns.len() != foreign_key.references_columns.len()
        {
            return Err(ExecutionError::InvalidOperation(format!(
                "foreign key on '{}' must pair each local column with a referenced column",
                table
            )));
        }
        if let Some(missing) = foreign_key
            .columns
            .iter()
            .find(|c| !live.columns.iter().any(|lc| &lc.name == *c))
        {
            return Err(ExecutionError::InvalidOperation(format!(
                "table '{}' has no column '{}'",
                table, missing
            )));
        }
        if live.foreign_key_position(&foreign_key.columns).is_some() {
            return Err(ExecutionError::InvalidOperation(format!(
                "table '{}' already has a foreign key on ({})",
                table,
                foreign_key.columns.join(", ")
            )));
        }

        live.foreign_keys.push(LiveForeignKey::from(foreign_key));
        live.foreign_keys.sort();
        self.rebuild(conn, &live).await
    }

    async fn drop_foreign_key(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        columns: &[String],
    ) -> Result<(), ExecutionError> {
        let mut live = rebuildable_table(conn, table).await?;
        let position =
            live.foreign_key_position(columns)
                .ok_or_else(|| ExecutionError::ForeignKeyNotFound {
                    table: table.to_string(),
                    columns: columns.to_vec(),
                })?;

        live.foreign_keys.remove(position);
        self.rebuild(conn, &live).await
    }

    /// Recreates `live.name` with the definition in `live`, then checks
    /// that every existing row satisfies its foreign keys.
    ///
    /// Foreign key enforcement is deferred only for the rebuild itself; the
    /// connection's previous setting is restored once the check passes, so
    /// later operations in the same transaction fail where they violate.
    async fn rebuild(
        &self,
        conn: &mut SqliteConnection,
        live: &LiveTable,
    ) -> Result<(), ExecutionError> {
        debug!(table = %live.name, "Rebuilding table");
        let (deferred,): (i64,) = sqlx::query_as("PRAGMA defer_foreign_keys")
            .fetch_one(&mut *conn)
            .await?;

        for statement in self.dialect.rebuild_table_sql(live) {
            run(conn, &statement).await?;
        }

        let violations = sqlx::query(&format!(
            "PRAGMA foreign_key_check({})",
            self.dialect.quote_identifier(&live.name)
        ))
        .fetch_all(&mut *conn)
        .await?;

        if !violations.is_empty() {
            return Err(ExecutionError::ForeignKeyViolation {
                table: live.name.clone(),
                count: violations.len(),
            });
        }
        if deferred == 0 {
            sqlx::query("PRAGMA defer_foreign_keys = OFF")
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

/// Loads a table that can be safely dropped and recreated.
///
/// Dropping a table fires the ON DELETE actions of foreign keys pointing
/// at it, so tables referenced with any action other than NO ACTION are
/// refused. CHECK constraints are not introspected and would be lost.
async fn rebuildable_table(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<LiveTable, ExecutionError> {
    let live = introspect::table(conn, table)
        .await?
        .ok_or_else(|| ExecutionError::TableNotFound(table.to_string()))?;

    if live.has_check {
        return Err(ExecutionError::Unsupported(format!(
            "table '{}' has CHECK constraints and cannot be rebuilt",
            table
        )));
    }
    if let Some((child, action)) = introspect::referencing_tables(conn, table)
        .await?
        .into_iter()
        .find(|(_, action)| action != "NO ACTION")
    {
        return Err(ExecutionError::Unsupported(format!(
            "table '{}' is referenced by '{}' with ON DELETE {} and cannot be rebuilt",
            table, child, action
        )));
    }
    Ok(live)
}

async fn run(
    conn: &mut SqliteConnection,
    statement: &Statement,
) -> Result<SqliteQueryResult, ExecutionError> {
    trace!(sql = %statement.sql, params = statement.params.len(), "Executing SQL");
    let query = statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), bind_value);
    Ok(query.execute(&mut *conn).await?)
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Integer(n) => query.bind(*n),
        SqlValue::Real(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Blob(b) => query.bind(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use crate::operations::ForeignKeyBuilder;
    use crate::schema::{ColumnSchema, ForeignKeyAction, SqlType};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
    use sqlx::Connection;
    use std::str::FromStr;

    async fn create_test_pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid sqlite url")
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    fn executor() -> OperationExecutor<SqliteDialect> {
        OperationExecutor::new(SqliteDialect::new())
    }

    fn create_themes() -> Operation {
        Operation::create_table(
            "Themes",
            vec![
                ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
                ColumnSchema::new("Title", SqlType::Text).not_null(),
            ],
            vec!["Id".to_string()],
        )
    }

    fn create_topics() -> Operation {
        Operation::create_table(
            "Topics",
            vec![
                ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
                ColumnSchema::new("ThemeId", SqlType::Uuid).not_null(),
                ColumnSchema::new("Title", SqlType::Text).not_null(),
            ],
            vec!["Id".to_string()],
        )
    }

    fn topics_theme_fk() -> ForeignKeySchema {
        ForeignKeyBuilder::new("FK_Topics_Themes_ThemeId")
            .columns(vec!["ThemeId".to_string()])
            .references("Themes", vec!["Id".to_string()])
            .build()
    }

    async fn count(conn: &mut SqliteConnection, table: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM \"{}\"", table))
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn test_create_table_twice_fails() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let exec = executor();

        exec.execute(&mut conn, &create_themes()).await.unwrap();
        let result = exec.execute(&mut conn, &create_themes()).await;
        assert!(matches!(result, Err(ExecutionError::Database(_))));
    }

    #[tokio::test]
    async fn test_row_operations() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let exec = executor();

        exec.execute(&mut conn, &create_themes()).await.unwrap();
        exec.execute(
            &mut conn,
            &Operation::insert_row("Themes", [("Id", "t1"), ("Title", "Children's services")]),
        )
        .await
        .unwrap();
        exec.execute(
            &mut conn,
            &Operation::update_row("Themes", "Id", "t1", [("Title", "Schools")]),
        )
        .await
        .unwrap();

        let (title,): (String,) = sqlx::query_as("SELECT \"Title\" FROM \"Themes\"")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(title, "Schools");

        exec.execute(&mut conn, &Operation::delete_row("Themes", "Id", "t1"))
            .await
            .unwrap();
        assert_eq!(count(&mut conn, "Themes").await, 0);
    }

    #[tokio::test]
    async fn test_missing_row_fails_loudly() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let exec = executor();
        exec.execute(&mut conn, &create_themes()).await.unwrap();

        let result = exec
            .execute(&mut conn, &Operation::delete_row("Themes", "Id", "gone"))
            .await;
        match result {
            Err(ExecutionError::NoMatchingRow {
                table, key_value, ..
            }) => {
                assert_eq!(table, "Themes");
                assert_eq!(key_value, "'gone'");
            }
            other => panic!("Expected NoMatchingRow, got {other:?}"),
        }

        let result = exec
            .execute(
                &mut conn,
                &Operation::update_row("Themes", "Id", "gone", [("Title", "x")]),
            )
            .await;
        assert!(matches!(result, Err(ExecutionError::NoMatchingRow { .. })));
    }

    #[tokio::test]
    async fn test_add_and_drop_foreign_key() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let exec = executor();

        exec.execute(&mut conn, &create_themes()).await.unwrap();
        exec.execute(&mut conn, &create_topics()).await.unwrap();
        exec.execute(
            &mut conn,
            &Operation::create_index(
                "IX_Topics_ThemeId",
                "Topics",
                vec!["ThemeId".to_string()],
                false,
            ),
        )
        .await
        .unwrap();
        exec.execute(
            &mut conn,
            &Operation::insert_row("Themes", [("Id", "t1"), ("Title", "Schools")]),
        )
        .await
        .unwrap();
        exec.execute(
            &mut conn,
            &Operation::insert_row(
                "Topics",
                [("Id", "p1"), ("ThemeId", "t1"), ("Title", "Pupil absence")],
            ),
        )
        .await
        .unwrap();

        exec.execute(
            &mut conn,
            &Operation::add_foreign_key("Topics", topics_theme_fk()),
        )
        .await
        .unwrap();

        let topics = introspect::table(&mut conn, "Topics").await.unwrap().unwrap();
        assert_eq!(topics.foreign_keys.len(), 1);
        assert_eq!(topics.index_sql.len(), 1);
        assert_eq!(count(&mut conn, "Topics").await, 1);

        let duplicate = exec
            .execute(
                &mut conn,
                &Operation::add_foreign_key("Topics", topics_theme_fk()),
            )
            .await;
        assert!(matches!(
            duplicate,
            Err(ExecutionError::InvalidOperation(_))
        ));

        exec.execute(
            &mut conn,
            &Operation::drop_foreign_key("Topics", vec!["ThemeId".to_string()]),
        )
        .await
        .unwrap();
        let topics = introspect::table(&mut conn, "Topics").await.unwrap().unwrap();
        assert!(topics.foreign_keys.is_empty());

        let missing = exec
            .execute(
                &mut conn,
                &Operation::drop_foreign_key("Topics", vec!["ThemeId".to_string()]),
            )
            .await;
        assert!(matches!(
            missing,
            Err(ExecutionError::ForeignKeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_key_on_orphan_rows_fails() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let exec = executor();

        exec.execute(&mut conn, &create_themes()).await.unwrap();
        exec.execute(&mut conn, &create_topics()).await.unwrap();
        exec.execute(
            &mut conn,
            &Operation::insert_row(
                "Topics",
                [("Id", "p1"), ("ThemeId", "missing"), ("Title", "Orphan")],
            ),
        )
        .await
        .unwrap();

        let mut tx = conn.begin().await.unwrap();
        let result = exec
            .execute(
                &mut tx,
                &Operation::add_foreign_key("Topics", topics_theme_fk()),
            )
            .await;
        match result {
            Err(ExecutionError::ForeignKeyViolation { table, count }) => {
                assert_eq!(table, "Topics");
                assert_eq!(count, 1);
            }
            other => panic!("Expected ForeignKeyViolation, got {other:?}"),
        }
        tx.rollback().await.unwrap();

        let topics = introspect::table(&mut conn, "Topics").await.unwrap().unwrap();
        assert!(topics.foreign_keys.is_empty());
        assert_eq!(count(&mut conn, "Topics").await, 1);
    }

    #[tokio::test]
    async fn test_orphan_insert_after_rebuild_fails_immediately() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let exec = executor();

        exec.execute(&mut conn, &create_themes()).await.unwrap();
        exec.execute(&mut conn, &create_topics()).await.unwrap();

        let mut tx = conn.begin().await.unwrap();
        exec.execute(
            &mut tx,
            &Operation::add_foreign_key("Topics", topics_theme_fk()),
        )
        .await
        .unwrap();

        let (deferred,): (i64,) = sqlx::query_as("PRAGMA defer_foreign_keys")
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(deferred, 0);

        let result = exec
            .execute(
                &mut tx,
                &Operation::insert_row(
                    "Topics",
                    [("Id", "p1"), ("ThemeId", "missing"), ("Title", "Orphan")],
                ),
            )
            .await;
        assert!(matches!(result, Err(ExecutionError::Database(_))));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_refuses_cascading_parents() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let exec = executor();

        exec.execute(&mut conn, &create_themes()).await.unwrap();
        exec.execute(
            &mut conn,
            &Operation::CreateTable {
                name: "Topics".to_string(),
                columns: vec![
                    ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
                    ColumnSchema::new("ThemeId", SqlType::Uuid).not_null(),
                ],
                primary_key: vec!["Id".to_string()],
                foreign_keys: vec![ForeignKeyBuilder::new("")
                    .columns(vec!["ThemeId".to_string()])
                    .references("Themes", vec!["Id".to_string()])
                    .on_delete(ForeignKeyAction::Cascade)
                    .build()],
            },
        )
        .await
        .unwrap();
        exec.execute(
            &mut conn,
            &Operation::create_table(
                "Owners",
                vec![ColumnSchema::new("Id", SqlType::Uuid).primary_key()],
                vec!["Id".to_string()],
            ),
        )
        .await
        .unwrap();
        exec.execute(
            &mut conn,
            &Operation::add_column("Themes", ColumnSchema::new("OwnerId", SqlType::Uuid)),
        )
        .await
        .unwrap();

        let result = exec
            .execute(
                &mut conn,
                &Operation::add_foreign_key(
                    "Themes",
                    ForeignKeyBuilder::new("")
                        .columns(vec!["OwnerId".to_string()])
                        .references("Owners", vec!["Id".to_string()])
                        .build(),
                ),
            )
            .await;
        assert!(matches!(result, Err(ExecutionError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let pool = create_test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let result = executor()
            .execute(
                &mut conn,
                &Operation::add_foreign_key("Topics", topics_theme_fk()),
            )
            .await;
        assert!(matches!(result, Err(ExecutionError::TableNotFound(t)) if t == "Topics"));
    }

    #[test]
    fn test_preview() {
        let exec = executor();

        let sql = exec
            .preview(&Operation::insert_row("Themes", [("Id", "t1")]))
            .unwrap();
        assert_eq!(sql, vec!["INSERT INTO \"Themes\" (\"Id\") VALUES ('t1')"]);

        let sql = exec
            .preview(&Operation::add_foreign_key("Topics", topics_theme_fk()))
            .unwrap();
        assert_eq!(
            sql,
            vec!["-- rebuild \"Topics\" adding FOREIGN KEY (\"ThemeId\") REFERENCES \"Themes\" (\"Id\")"]
        );
    }
}
