//! migrate CLI
//!
//! Command-line tool for applying and rolling back ledger-tracked migrations.

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ledger_migrate::loader::{load_dir, write_new_unit};
use ledger_migrate::prelude::*;

/// Ledger-tracked, reversible database migrations.
#[derive(Parser)]
#[command(name = "migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite://db.sqlite3")]
    database: String,

    /// Migrations directory.
    #[arg(short, long, env = "MIGRATIONS_DIR", default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Ledger table name.
    #[arg(long, env = "MIGRATE_LEDGER_TABLE", default_value = "__migration_ledger")]
    ledger_table: String,

    /// Identity recorded in the lock while running (defaults to the process id).
    #[arg(long, env = "MIGRATE_LOCK_HOLDER")]
    lock_holder: Option<String>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations.
    Up {
        /// Stop after applying this migration.
        #[arg(short, long)]
        target: Option<String>,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back applied migrations, newest first.
    Down {
        /// Number of migrations to roll back.
        #[arg(short, long, default_value_t = 1)]
        steps: usize,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show applied and pending migrations.
    Status,

    /// Create an empty migration file.
    New {
        /// Migration description, e.g. "add publication slugs".
        description: String,
    },

    /// Show SQL for one migration without executing.
    Sql {
        /// Migration name.
        name: String,

        /// Show rollback SQL instead of forward SQL.
        #[arg(short, long)]
        reverse: bool,
    },

    /// Check that every migration's reverse undoes its forward.
    Check {
        /// Also run pending migrations against the database and roll them back.
        #[arg(long)]
        live: bool,
    },

    /// Release a lock left behind by a crashed run.
    Unlock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = MigrateConfig {
        database_url: cli.database,
        migrations_dir: cli.migrations_dir,
        ledger_table: cli.ledger_table,
        ..MigrateConfig::default()
    };
    if let Some(holder) = cli.lock_holder {
        config.lock_holder = holder;
    }
    config.validate()?;

    if run_offline(&cli.command, &config)? {
        return Ok(());
    }

    let pool = config.connect().await?;
    let runner = config.runner(pool);

    match cli.command {
        Commands::Up { target, dry_run } => {
            let units = load_dir(&config.migrations_dir)?;
            if dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
                print_plan(&runner.plan_up(&units, target.as_deref()).await?);
            } else {
                runner.apply_pending(&units, target.as_deref()).await?;
            }
        }

        Commands::Down { steps, dry_run } => {
            let units = load_dir(&config.migrations_dir)?;
            if dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
                print_plan(&runner.plan_down(&units, steps).await?);
            } else {
                runner.rollback_last(&units, steps).await?;
            }
        }

        Commands::Status => {
            let units = load_dir(&config.migrations_dir)?;
            let statuses = runner.status(&units).await?;

            if statuses.is_empty() {
                info!("No migrations found.");
            } else {
                println!("\nMigrations:");
                println!("{:-<60}", "");
                for status in &statuses {
                    match &status.state {
                        UnitState::Applied {
                            applied_at,
                            modified,
                        } => println!(
                            " [X] {} ({}){}",
                            status.name,
                            applied_at.format("%Y-%m-%d %H:%M:%S"),
                            if *modified { " MODIFIED" } else { "" }
                        ),
                        UnitState::Pending => println!(" [ ] {}", status.name),
                        UnitState::Orphaned { applied_at } => println!(
                            " [?] {} ({}) not found in {}",
                            status.name,
                            applied_at.format("%Y-%m-%d %H:%M:%S"),
                            config.migrations_dir.display()
                        ),
                    }
                }
                println!();
            }
        }

        Commands::Check { .. } => {
            let units = load_dir(&config.migrations_dir)?;
            check_units(&units)?;
            let checked = runner.verify_round_trip(&units).await?;
            info!(
                units = units.len(),
                live = checked.len(),
                "All migrations round-trip"
            );
        }

        Commands::Unlock => match runner.force_unlock().await? {
            Some(previous) => info!(
                "Released lock held by '{}' since {}",
                previous.holder, previous.acquired_at
            ),
            None => info!("Ledger was not locked."),
        },

        Commands::New { .. } | Commands::Sql { .. } => {}
    }

    Ok(())
}

/// Runs the commands that never touch the database. Returns whether
/// `command` was one of them.
fn run_offline(command: &Commands, config: &MigrateConfig) -> anyhow::Result<bool> {
    match command {
        Commands::New { description } => {
            let path = write_new_unit(&config.migrations_dir, description, Utc::now())?;
            info!("Created migration: {}", path.display());
        }
        Commands::Check { live: false } => {
            let units = load_dir(&config.migrations_dir)?;
            let schema = check_units(&units)?;
            info!(
                units = units.len(),
                tables = schema.tables.len(),
                "All migrations round-trip"
            );
        }
        Commands::Sql { name, reverse } => {
            let units = load_dir(&config.migrations_dir)?;
            let unit = units
                .iter()
                .find(|u| u.name() == name.as_str())
                .ok_or_else(|| MigrateError::UnknownMigration(name.clone()))?;
            let direction = if *reverse {
                Direction::Reverse
            } else {
                Direction::Forward
            };
            let executor = OperationExecutor::new(SqliteDialect::new());
            print_plan(&[PlannedUnit::render(&executor, unit, direction)?]);
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn print_plan(plan: &[PlannedUnit]) {
    if plan.is_empty() {
        info!("Nothing to run.");
        return;
    }
    for unit in plan {
        let label = match unit.direction {
            Direction::Forward => "apply",
            Direction::Reverse => "rollback",
        };
        println!("-- {} {}", label, unit.name);
        println!("BEGIN;");
        for statement in &unit.statements {
            println!("{};", statement);
        }
        println!("COMMIT;\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_in(dir: &std::path::Path) -> MigrateConfig {
        let migrations_dir = dir.join("migrations");
        fs::create_dir(&migrations_dir).unwrap();
        fs::write(
            migrations_dir.join("20180102093122_initial.json"),
            r#"{"forward": [{"op": "create_table", "name": "Themes",
                "columns": [{"name": "Id", "sql_type": "Uuid", "primary_key": true}],
                "primary_key": ["Id"]}]}"#,
        )
        .unwrap();
        MigrateConfig {
            database_url: format!("sqlite://{}", dir.join("db.sqlite3").display()),
            migrations_dir,
            ..MigrateConfig::default()
        }
    }

    #[test]
    fn test_sql_runs_without_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let command = Commands::Sql {
            name: "20180102093122_initial".to_string(),
            reverse: true,
        };

        assert!(run_offline(&command, &config).unwrap());
        assert!(!dir.path().join("db.sqlite3").exists());
    }

    #[test]
    fn test_sql_unknown_migration() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let command = Commands::Sql {
            name: "20190101000000_missing".to_string(),
            reverse: false,
        };

        let err = run_offline(&command, &config).unwrap_err();
        assert!(err.to_string().contains("20190101000000_missing"));
    }

    #[test]
    fn test_database_commands_are_not_offline() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        assert!(!run_offline(&Commands::Status, &config).unwrap());
        assert!(!run_offline(&Commands::Check { live: true }, &config).unwrap());
    }
}
