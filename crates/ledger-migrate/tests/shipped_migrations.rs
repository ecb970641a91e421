//! The unit files under `migrations/` load, check, apply and roll back.

mod common;

use std::path::PathBuf;

use common::*;
use ledger_migrate::loader::load_dir;
use ledger_migrate::prelude::*;

fn migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

fn load() -> Vec<MigrationUnit> {
    load_dir(&migrations_dir()).unwrap_or_else(|e| panic!("Failed to load migrations: {e}"))
}

#[test]
fn shipped_units_load_in_order() {
    let units = load();
    let names: Vec<&str> = units.iter().map(MigrationUnit::name).collect();
    assert_eq!(
        names,
        vec![
            "20180102093122_initial",
            "20180102094517_seed_themes",
            "20180215110423_publication_slugs",
            "20180301143012_methodologies",
        ]
    );
}

#[test]
fn shipped_units_round_trip_statically() {
    let schema = check_units(&load()).unwrap();

    let publications = schema.get_table("Publications").unwrap();
    let columns: Vec<&str> = publications.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        columns,
        vec!["Id", "Title", "Summary", "NextUpdate", "TopicId", "Slug", "MethodologyId"]
    );
    assert_eq!(publications.foreign_keys.len(), 2);
    assert!(schema.get_table("Methodologies").is_some());
}

#[tokio::test]
async fn shipped_units_apply_and_roll_back() {
    let pool = create_test_pool().await;
    let runner = runner(&pool);
    let units = load();

    let applied = runner.apply_pending(&units, None).await.unwrap();
    assert_eq!(applied.len(), 4);

    let slug: (String, Option<String>) = sqlx::query_as(
        "SELECT \"Slug\", \"MethodologyId\" FROM \"Publications\" WHERE \"Id\" = ?",
    )
    .bind("89869bba-0c00-40f7-b7d6-e28cb904ad37")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(slug.0, "childcare-and-early-years-survey-of-parents");
    assert_eq!(
        slug.1.as_deref(),
        Some("caa8e56f-41d2-4129-a5c3-53b051134bd7")
    );

    // The rebuilt table still enforces the new foreign key
    let orphan = sqlx::query("UPDATE \"Publications\" SET \"MethodologyId\" = 'missing'")
        .execute(&pool)
        .await;
    assert!(orphan.is_err());

    let rolled_back = runner.rollback_last(&units, units.len()).await.unwrap();
    assert_eq!(rolled_back.len(), 4);
    assert!(ledger_names(&runner).await.is_empty());
    for table in ["Themes", "Topics", "Publications", "Methodologies"] {
        assert!(!table_exists(&pool, table).await, "{table} still exists");
    }
}

#[tokio::test]
async fn shipped_units_round_trip_live() {
    let pool = create_test_pool().await;
    let runner = runner(&pool);
    let units = load();

    let checked = runner.verify_round_trip(&units).await.unwrap();

    assert_eq!(checked.len(), 4);
    assert!(!table_exists(&pool, "Themes").await);
}

#[tokio::test]
async fn dry_run_plan_matches_pending_units() {
    let pool = create_test_pool().await;
    let runner = runner(&pool);
    let units = load();
    runner
        .apply_pending(&units, Some("20180102094517_seed_themes"))
        .await
        .unwrap();

    let plan = runner.plan_up(&units, None).await.unwrap();

    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0].name, "20180215110423_publication_slugs");
    assert!(plan[0].statements[0].starts_with("ALTER TABLE \"Publications\" ADD COLUMN \"Slug\""));
    assert!(plan[1]
        .statements
        .iter()
        .any(|s| s.starts_with("-- rebuild \"Publications\"")));
    assert!(!table_exists(&pool, "Methodologies").await);
}
