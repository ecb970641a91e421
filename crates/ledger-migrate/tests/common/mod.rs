#![allow(dead_code)]

use std::str::FromStr;

use ledger_migrate::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub const SCIENCE_ID: &str = "cc8e02fd-5599-41aa-940d-26bca68eab53";
pub const MISSING_THEME_ID: &str = "00000000-0000-0000-0000-000000000000";

pub async fn create_test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("valid sqlite url")
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("Failed to create in-memory SQLite pool")
}

pub fn runner(pool: &SqlitePool) -> MigrationRunner<SqliteDialect> {
    MigrationRunner::new(pool.clone(), SqliteDialect::new()).lock_holder("test-runner")
}

pub fn unit(name: &str, forward: Vec<Operation>) -> MigrationUnit {
    MigrationUnit::auto_reversed(name, forward)
        .unwrap_or_else(|e| panic!("Failed to build unit {name}: {e}"))
}

pub fn create_themes_table() -> Operation {
    Operation::create_table(
        "Themes",
        vec![
            ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
            ColumnSchema::new("Title", SqlType::Text).not_null(),
        ],
        vec!["Id".to_string()],
    )
}

pub fn create_topics_table() -> Operation {
    Operation::CreateTable {
        name: "Topics".to_string(),
        columns: vec![
            ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
            ColumnSchema::new("Title", SqlType::Text).not_null(),
            ColumnSchema::new("ThemeId", SqlType::Uuid).not_null(),
        ],
        primary_key: vec!["Id".to_string()],
        foreign_keys: vec![ForeignKeyBuilder::new("FK_Topics_Themes_ThemeId")
            .columns(vec!["ThemeId".to_string()])
            .references("Themes", vec!["Id".to_string()])
            .build()],
    }
}

/// Unit `A`: creates `Themes (Id, Title)`.
pub fn unit_a() -> MigrationUnit {
    unit("20180102093122_create_themes", vec![create_themes_table()])
}

/// Unit `B`: seeds the Science theme.
pub fn unit_b() -> MigrationUnit {
    unit(
        "20180102094517_seed_science",
        vec![Operation::insert_row(
            "Themes",
            [("Id", SCIENCE_ID), ("Title", "Science")],
        )],
    )
}

/// Ledger names, in ledger order.
pub async fn ledger_names(runner: &MigrationRunner<SqliteDialect>) -> Vec<String> {
    let mut conn = runner.pool().acquire().await.expect("connection");
    runner
        .ledger()
        .entries(&mut conn)
        .await
        .expect("ledger entries")
        .into_iter()
        .map(|e| e.migration_name)
        .collect()
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(pool)
            .await
            .expect("sqlite_master query");
    row.is_some()
}

pub async fn theme_rows(pool: &SqlitePool) -> Vec<(String, String)> {
    sqlx::query_as("SELECT \"Id\", \"Title\" FROM \"Themes\" ORDER BY \"Id\"")
        .fetch_all(pool)
        .await
        .expect("Themes query")
}
