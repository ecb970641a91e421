//! Example: Statistics Publications Migrations
//!
//! This example demonstrates how to use ledger-migrate to manage database
//! schema and seed-data changes for a statistics publication site with
//! themes, topics, publications and releases.
//!
//! Run with: cargo run --example publications -p ledger-migrate

use ledger_migrate::prelude::*;

// =============================================================================
// Migration Definitions
// =============================================================================

const SCIENCE_ID: &str = "cc8e02fd-5599-41aa-940d-26bca68eab53";
const TOPIC_ID: &str = "1003fa5c-b60a-4036-a178-e3a69a81b852";
const PUBLICATION_ID: &str = "89869bba-0c00-40f7-b7d6-e28cb904ad37";

/// Initial migration: themes, topics and publications
struct CreateThemes;

impl LedgerMigration for CreateThemes {
    const NAME: &'static str = "20180102093122_initial";

    fn forward() -> Vec<Operation> {
        vec![
            Operation::create_table(
                "Themes",
                vec![
                    ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
                    ColumnSchema::new("Title", SqlType::Text).not_null(),
                ],
                vec!["Id".to_string()],
            ),
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
                    .on_delete(ForeignKeyAction::Cascade)
                    .build()],
            },
            Operation::CreateTable {
                name: "Publications".to_string(),
                columns: vec![
                    ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
                    ColumnSchema::new("Title", SqlType::Text).not_null(),
                    ColumnSchema::new("TopicId", SqlType::Uuid).not_null(),
                ],
                primary_key: vec!["Id".to_string()],
                foreign_keys: vec![ForeignKeyBuilder::new("FK_Publications_Topics_TopicId")
                    .columns(vec!["TopicId".to_string()])
                    .references("Topics", vec!["Id".to_string()])
                    .build()],
            },
        ]
    }
}

/// Second migration: seed rows
struct SeedThemes;

impl LedgerMigration for SeedThemes {
    const NAME: &'static str = "20180102094517_seed_themes";

    fn forward() -> Vec<Operation> {
        vec![
            Operation::insert_row("Themes", [("Id", SCIENCE_ID), ("Title", "Science")]),
            Operation::insert_row(
                "Topics",
                [
                    ("Id", TOPIC_ID),
                    ("Title", "Childcare and early years"),
                    ("ThemeId", SCIENCE_ID),
                ],
            ),
            Operation::insert_row(
                "Publications",
                [
                    ("Id", PUBLICATION_ID),
                    ("Title", "Childcare and early years survey of parents"),
                    ("TopicId", TOPIC_ID),
                ],
            ),
        ]
    }
}

/// Third migration: publication slugs and key statistics
struct AddSlugs;

impl LedgerMigration for AddSlugs {
    const NAME: &'static str = "20180215110423_publication_slugs";

    fn forward() -> Vec<Operation> {
        vec![
            Operation::add_column("Publications", ColumnSchema::new("Slug", SqlType::Varchar(200))),
            Operation::add_column("Publications", ColumnSchema::new("KeyStatistics", SqlType::Json)),
            Operation::update_row(
                "Publications",
                "Id",
                PUBLICATION_ID,
                [
                    ("Slug", "childcare-and-early-years-survey-of-parents"),
                    ("KeyStatistics", r#"[{"label":"Parents using childcare","value":"78%"}]"#),
                ],
            ),
            Operation::create_index(
                "IX_Publications_Slug",
                "Publications",
                vec!["Slug".to_string()],
                true,
            ),
        ]
    }

    // The row update is undone by dropping its columns
    fn reverse() -> Option<Vec<Operation>> {
        Some(vec![
            Operation::drop_index("IX_Publications_Slug"),
            Operation::drop_column("Publications", "KeyStatistics"),
            Operation::drop_column("Publications", "Slug"),
        ])
    }
}

/// Fourth migration: releases, linked to publications after the fact
struct AddReleases;

impl LedgerMigration for AddReleases {
    const NAME: &'static str = "20180301143012_releases";

    fn forward() -> Vec<Operation> {
        vec![
            Operation::create_table(
                "Releases",
                vec![
                    ColumnSchema::new("Id", SqlType::Uuid).primary_key(),
                    ColumnSchema::new("Title", SqlType::Text).not_null(),
                    ColumnSchema::new("Published", SqlType::DateTime),
                    ColumnSchema::new("PublicationId", SqlType::Uuid),
                ],
                vec!["Id".to_string()],
            ),
            Operation::add_foreign_key(
                "Releases",
                ForeignKeyBuilder::new("FK_Releases_Publications_PublicationId")
                    .columns(vec!["PublicationId".to_string()])
                    .references("Publications", vec!["Id".to_string()])
                    .build(),
            ),
            Operation::insert_row(
                "Releases",
                [
                    ("Id", "f75bc75e-ae58-4bc4-9b14-305ad5e4ff7d"),
                    ("Title", "2016-17"),
                    ("Published", "2017-06-22 00:00:00"),
                    ("PublicationId", PUBLICATION_ID),
                ],
            ),
        ]
    }
}

// =============================================================================
// Main: Demonstrate the Migration System
// =============================================================================

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    println!("{}", "=".repeat(70));
    println!(" LEDGER-MIGRATE: Statistics Publications Example");
    println!("{}", "=".repeat(70));
    println!();

    // Create in-memory SQLite database
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    // Create runner with SQLite dialect
    let runner = MigrationRunner::new(pool, SqliteDialect::new()).lock_holder("example");

    // Initialize (create ledger and lock tables)
    println!("[1] Initializing migration ledger...");
    runner.init().await?;
    println!("    Created {} table\n", runner.ledger().table_name());

    let units = vec![
        CreateThemes::to_unit()?,
        SeedThemes::to_unit()?,
        AddSlugs::to_unit()?,
        AddReleases::to_unit()?,
    ];

    // Check every unit round-trips before touching the database
    println!("[2] Checking units statically...");
    let schema = check_units(&units)?;
    println!("    Final schema has {} tables\n", schema.tables.len());

    // Show pending migrations
    println!("[3] Checking pending migrations...");
    let pending = runner.pending(&units).await?;
    println!("    {} migrations pending:\n", pending.len());
    for unit in &pending {
        println!("    - {}", unit.name());
    }
    println!();

    // Show SQL for each migration (dry run)
    println!("[4] Generated SQL for migrations:");
    println!("{}", "-".repeat(70));
    for planned in runner.plan_up(&units, None).await? {
        println!("\n-- Migration: {}", planned.name);
        for sql in &planned.statements {
            println!("{};", sql);
        }
    }
    println!();
    println!("{}", "-".repeat(70));
    println!();

    // Apply all migrations
    println!("[5] Applying migrations...\n");
    for name in runner.apply_pending(&units, None).await? {
        println!("    Applied {}", name);
    }
    println!();

    // Show status
    println!("[6] Migration status:\n");
    for status in runner.status(&units).await? {
        match status.state {
            UnitState::Applied { applied_at, .. } => println!(
                "    [X] {} ({})",
                status.name,
                applied_at.format("%Y-%m-%d %H:%M:%S")
            ),
            UnitState::Pending => println!("    [ ] {}", status.name),
            UnitState::Orphaned { .. } => println!("    [?] {}", status.name),
        }
    }
    println!();

    // Demonstrate a failing unit
    println!("[7] Demonstrating a failing migration...\n");
    let broken = MigrationUnit::auto_reversed(
        "20180402080000_orphan_topic",
        vec![Operation::insert_row(
            "Topics",
            [
                ("Id", "4c658598-450b-4493-b972-8812acd154a7"),
                ("Title", "Destinations"),
                ("ThemeId", "00000000-0000-0000-0000-000000000000"),
            ],
        )],
    )?;
    let mut with_broken = units.clone();
    with_broken.push(broken);
    match runner.apply_pending(&with_broken, None).await {
        Err(e) => println!("    Failed as expected: {}\n", e),
        Ok(_) => println!("    Unexpectedly succeeded\n"),
    }

    // Demonstrate rollback
    println!("[8] Rolling back the last two migrations...\n");
    for name in runner.rollback_last(&units, 2).await? {
        println!("    Rolled back {}", name);
    }
    println!();

    // Re-apply through verification
    println!("[9] Verifying pending migrations round-trip against the database...\n");
    for name in runner.verify_round_trip(&units).await? {
        println!("    {} OK", name);
    }
    runner.apply_pending(&units, None).await?;
    println!();

    println!("{}", "=".repeat(70));
    println!(" Example completed successfully!");
    println!("{}", "=".repeat(70));

    Ok(())
}
