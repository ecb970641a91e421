//! Migration runner.
//!
//! Applies pending units in name order and rolls applied ones back in
//! reverse order. Every unit runs in its own transaction on a single
//! connection, and its ledger row is written inside that transaction, so
//! a unit is either fully applied and recorded or not at all. The ledger
//! lock is held for the whole run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Connection;
use tracing::{debug, info, warn};

use crate::dialect::MigrationDialect;
use crate::error::{MigrateError, Result};
use crate::executor::OperationExecutor;
use crate::introspect;
use crate::ledger::{verify_prefix, Ledger, LedgerEntry, DEFAULT_LEDGER_TABLE};
use crate::lock::{LedgerLock, LockHolder};
use crate::unit::{ordered, Direction, MigrationUnit};

/// Where a unit stands relative to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    /// Recorded in the ledger.
    Applied {
        /// When it was applied.
        applied_at: DateTime<Utc>,
        /// Whether the unit changed since it was applied.
        modified: bool,
    },
    /// Not yet applied.
    Pending,
    /// In the ledger but not among the known units.
    Orphaned {
        /// When it was applied.
        applied_at: DateTime<Utc>,
    },
}

/// One line of `migrate status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    /// Unit name.
    pub name: String,
    /// Its state.
    pub state: UnitState,
}

/// The statements a unit would run, for dry runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUnit {
    /// Unit name.
    pub name: String,
    /// Direction it would run in.
    pub direction: Direction,
    /// Rendered statements, in order.
    pub statements: Vec<String>,
}

impl PlannedUnit {
    /// Renders the statements of one direction of a unit without touching a
    /// database.
    pub fn render<D: MigrationDialect>(
        executor: &OperationExecutor<D>,
        unit: &MigrationUnit,
        direction: Direction,
    ) -> Result<Self> {
        let mut statements = Vec::new();
        for (index, operation) in unit.operations(direction).iter().enumerate() {
            let sql = executor.preview(operation).map_err(|cause| {
                MigrateError::OperationExecutionFailure {
                    unit_name: unit.name().to_string(),
                    operation_index: index,
                    cause,
                }
            })?;
            statements.extend(sql);
        }
        Ok(Self {
            name: unit.name().to_string(),
            direction,
            statements,
        })
    }
}

/// Applies and rolls back migration units against one database.
pub struct MigrationRunner<D: MigrationDialect> {
    pool: SqlitePool,
    executor: OperationExecutor<D>,
    ledger: Ledger,
    lock: LedgerLock,
    holder: String,
}

impl<D: MigrationDialect> MigrationRunner<D> {
    /// Creates a runner using the default ledger table.
    pub fn new(pool: SqlitePool, dialect: D) -> Self {
        Self {
            pool,
            executor: OperationExecutor::new(dialect),
            ledger: Ledger::default(),
            lock: LedgerLock::for_ledger(DEFAULT_LEDGER_TABLE),
            holder: format!("pid:{}", std::process::id()),
        }
    }

    /// Stores the ledger (and its lock) in `table`.
    #[must_use]
    pub fn ledger_table(mut self, table: &str) -> Self {
        self.ledger = Ledger::new(table);
        self.lock = LedgerLock::for_ledger(table);
        self
    }

    /// Identity recorded in the lock while this runner holds it.
    #[must_use]
    pub fn lock_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Returns the ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Returns the lock.
    #[must_use]
    pub fn lock(&self) -> &LedgerLock {
        &self.lock
    }

    /// Returns the executor.
    #[must_use]
    pub fn executor(&self) -> &OperationExecutor<D> {
        &self.executor
    }

    /// Returns the pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ensures the ledger and lock tables exist.
    pub async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.ensure_tables(&mut conn).await
    }

    async fn ensure_tables(&self, conn: &mut SqliteConnection) -> Result<()> {
        self.ledger.ensure_table(conn).await?;
        self.lock.ensure_table(conn).await
    }

    /// Applies every pending unit in name order, or those up to and
    /// including `target`. Returns the names applied.
    ///
    /// Stops at the first failing unit; units committed before it stay
    /// applied.
    pub async fn apply_pending(
        &self,
        units: &[MigrationUnit],
        target: Option<&str>,
    ) -> Result<Vec<String>> {
        let units = ordered(units)?;
        let end = target_end(&units, target)?;

        let mut conn = self.pool.acquire().await?;
        self.ensure_tables(&mut conn).await?;
        self.lock.acquire(&mut conn, &self.holder).await?;

        let result = self.apply_locked(&mut conn, &units, end).await;
        let released = self.lock.release(&mut conn, &self.holder).await;
        let applied = result?;
        released?;

        if applied.is_empty() {
            info!("No pending migrations");
        } else {
            info!(count = applied.len(), "Migrations applied");
        }
        Ok(applied)
    }

    async fn apply_locked(
        &self,
        conn: &mut SqliteConnection,
        units: &[&MigrationUnit],
        end: usize,
    ) -> Result<Vec<String>> {
        let pending = self.select_pending(conn, units, end).await?;
        let mut applied = Vec::with_capacity(pending.len());
        for unit in pending {
            self.run_unit(conn, unit, Direction::Forward).await?;
            applied.push(unit.name().to_string());
        }
        Ok(applied)
    }

    /// Rolls back the last `steps` applied units, newest first. Returns the
    /// names rolled back.
    pub async fn rollback_last(&self, units: &[MigrationUnit], steps: usize) -> Result<Vec<String>> {
        let units = ordered(units)?;

        let mut conn = self.pool.acquire().await?;
        self.ensure_tables(&mut conn).await?;
        self.lock.acquire(&mut conn, &self.holder).await?;

        let result = self.rollback_locked(&mut conn, &units, steps).await;
        let released = self.lock.release(&mut conn, &self.holder).await;
        let rolled_back = result?;
        released?;

        if rolled_back.is_empty() {
            info!("Nothing to roll back");
        } else {
            info!(count = rolled_back.len(), "Migrations rolled back");
        }
        Ok(rolled_back)
    }

    async fn rollback_locked(
        &self,
        conn: &mut SqliteConnection,
        units: &[&MigrationUnit],
        steps: usize,
    ) -> Result<Vec<String>> {
        let targets = self.select_applied(conn, units, steps).await?;
        let mut rolled_back = Vec::with_capacity(targets.len());
        for unit in targets {
            self.run_unit(conn, unit, Direction::Reverse).await?;
            rolled_back.push(unit.name().to_string());
        }
        Ok(rolled_back)
    }

    /// Runs one direction of a unit and updates the ledger, atomically.
    async fn run_unit(
        &self,
        conn: &mut SqliteConnection,
        unit: &MigrationUnit,
        direction: Direction,
    ) -> Result<()> {
        match direction {
            Direction::Forward => info!(unit = %unit.name(), "Applying migration"),
            Direction::Reverse => info!(unit = %unit.name(), "Rolling back migration"),
        }

        let mut tx = conn.begin().await?;
        for (index, operation) in unit.operations(direction).iter().enumerate() {
            debug!(unit = %unit.name(), operation = index, "Running operation");
            if let Err(cause) = self.executor.execute(&mut tx, operation).await {
                warn!(
                    unit = %unit.name(),
                    operation = index,
                    error = %cause,
                    "Operation failed, rolling back migration"
                );
                if let Err(e) = tx.rollback().await {
                    warn!(unit = %unit.name(), error = %e, "Transaction rollback failed");
                }
                return Err(MigrateError::OperationExecutionFailure {
                    unit_name: unit.name().to_string(),
                    operation_index: index,
                    cause,
                });
            }
        }

        let recorded = match direction {
            Direction::Forward => self.ledger.record_applied(&mut tx, unit).await,
            Direction::Reverse => self.ledger.record_unapplied(&mut tx, unit.name()).await,
        };
        let committed = match recorded {
            Ok(()) => tx.commit().await.map_err(MigrateError::from),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(unit = %unit.name(), error = %rollback, "Transaction rollback failed");
                }
                Err(e)
            }
        };
        if let Err(cause) = committed {
            warn!(unit = %unit.name(), error = %cause, "Migration failed to commit");
            return Err(MigrateError::UnitCommitFailure {
                unit_name: unit.name().to_string(),
                cause: Box::new(cause),
            });
        }

        match direction {
            Direction::Forward => info!(unit = %unit.name(), "Migration applied successfully"),
            Direction::Reverse => {
                info!(unit = %unit.name(), "Migration rolled back successfully")
            }
        }
        Ok(())
    }

    /// Ledger entries, empty if the ledger does not exist yet.
    async fn entries(&self, conn: &mut SqliteConnection) -> Result<Vec<LedgerEntry>> {
        if self.ledger.exists(conn).await? {
            self.ledger.entries(conn).await
        } else {
            Ok(Vec::new())
        }
    }

    /// Pending units among `units[..end]`, after checking the ledger.
    async fn select_pending<'a>(
        &self,
        conn: &mut SqliteConnection,
        units: &[&'a MigrationUnit],
        end: usize,
    ) -> Result<Vec<&'a MigrationUnit>> {
        let entries = self.entries(conn).await?;
        verify_prefix(&entries, units)?;
        Ok(units
            .iter()
            .take(end)
            .skip(entries.len())
            .copied()
            .collect())
    }

    /// The last `steps` applied units, newest first, after checking the ledger.
    async fn select_applied<'a>(
        &self,
        conn: &mut SqliteConnection,
        units: &[&'a MigrationUnit],
        steps: usize,
    ) -> Result<Vec<&'a MigrationUnit>> {
        let entries = self.entries(conn).await?;
        verify_prefix(&entries, units)?;
        Ok(units[..entries.len()]
            .iter()
            .rev()
            .take(steps)
            .copied()
            .collect())
    }

    /// Units not yet applied, in application order.
    pub async fn pending<'a>(&self, units: &'a [MigrationUnit]) -> Result<Vec<&'a MigrationUnit>> {
        let units = ordered(units)?;
        let mut conn = self.pool.acquire().await?;
        self.select_pending(&mut conn, &units, units.len()).await
    }

    /// State of every known unit and every ledger entry, by name.
    ///
    /// Reads only; does not take the lock or check ledger order.
    pub async fn status(&self, units: &[MigrationUnit]) -> Result<Vec<UnitStatus>> {
        let units = ordered(units)?;
        let mut conn = self.pool.acquire().await?;
        let mut entries: BTreeMap<String, LedgerEntry> = self
            .entries(&mut conn)
            .await?
            .into_iter()
            .map(|e| (e.migration_name.clone(), e))
            .collect();

        let mut statuses = Vec::with_capacity(units.len());
        for unit in units {
            let state = match entries.remove(unit.name()) {
                Some(entry) => UnitState::Applied {
                    applied_at: entry.applied_at,
                    modified: unit.checksum()? != entry.checksum,
                },
                None => UnitState::Pending,
            };
            statuses.push(UnitStatus {
                name: unit.name().to_string(),
                state,
            });
        }
        statuses.extend(entries.into_values().map(|entry| UnitStatus {
            name: entry.migration_name,
            state: UnitState::Orphaned {
                applied_at: entry.applied_at,
            },
        }));
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    /// What [`MigrationRunner::apply_pending`] would run, without running it.
    pub async fn plan_up(
        &self,
        units: &[MigrationUnit],
        target: Option<&str>,
    ) -> Result<Vec<PlannedUnit>> {
        let units = ordered(units)?;
        let end = target_end(&units, target)?;
        let mut conn = self.pool.acquire().await?;
        let pending = self.select_pending(&mut conn, &units, end).await?;
        pending
            .into_iter()
            .map(|unit| self.plan_unit(unit, Direction::Forward))
            .collect()
    }

    /// What [`MigrationRunner::rollback_last`] would run, without running it.
    pub async fn plan_down(&self, units: &[MigrationUnit], steps: usize) -> Result<Vec<PlannedUnit>> {
        let units = ordered(units)?;
        let mut conn = self.pool.acquire().await?;
        let targets = self.select_applied(&mut conn, &units, steps).await?;
        targets
            .into_iter()
            .map(|unit| self.plan_unit(unit, Direction::Reverse))
            .collect()
    }

    /// Renders the statements of one direction of a unit.
    pub fn plan_unit(&self, unit: &MigrationUnit, direction: Direction) -> Result<PlannedUnit> {
        PlannedUnit::render(&self.executor, unit, direction)
    }

    /// Checks that each pending unit's reverse list undoes its forward list
    /// against the real database.
    ///
    /// Everything runs in one transaction that is always rolled back; the
    /// database and ledger are left untouched. For each pending unit the
    /// tables are snapshotted, forward and reverse are run, and the snapshot
    /// is compared; forward is then run again so the next unit sees the
    /// schema it expects. Returns the names checked.
    pub async fn verify_round_trip(&self, units: &[MigrationUnit]) -> Result<Vec<String>> {
        let units = ordered(units)?;
        let mut conn = self.pool.acquire().await?;
        let pending = self.select_pending(&mut conn, &units, units.len()).await?;
        let exclude = [self.ledger.table_name(), self.lock.table_name()];

        let mut tx = conn.begin().await?;
        let mut checked = Vec::with_capacity(pending.len());
        let mut outcome = Ok(());
        for unit in pending {
            outcome = self.round_trip_unit(&mut tx, unit, &exclude).await;
            if outcome.is_err() {
                break;
            }
            checked.push(unit.name().to_string());
        }

        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "Round-trip transaction rollback failed");
        }
        outcome?;
        info!(count = checked.len(), "Round trip verified");
        Ok(checked)
    }

    async fn round_trip_unit(
        &self,
        conn: &mut SqliteConnection,
        unit: &MigrationUnit,
        exclude: &[&str],
    ) -> Result<()> {
        debug!(unit = %unit.name(), "Verifying round trip");
        let before = introspect::snapshot(conn, exclude).await?;
        self.run_operations(conn, unit, Direction::Forward).await?;
        self.run_operations(conn, unit, Direction::Reverse).await?;
        let after = introspect::snapshot(conn, exclude).await?;

        if let Some(detail) = before.diff(&after) {
            return Err(MigrateError::RoundTripMismatch {
                unit_name: unit.name().to_string(),
                detail,
            });
        }
        self.run_operations(conn, unit, Direction::Forward).await
    }

    async fn run_operations(
        &self,
        conn: &mut SqliteConnection,
        unit: &MigrationUnit,
        direction: Direction,
    ) -> Result<()> {
        for (index, operation) in unit.operations(direction).iter().enumerate() {
            self.executor
                .execute(conn, operation)
                .await
                .map_err(|cause| MigrateError::OperationExecutionFailure {
                    unit_name: unit.name().to_string(),
                    operation_index: index,
                    cause,
                })?;
        }
        Ok(())
    }

    /// Releases the ledger lock whoever holds it, returning the previous
    /// holder. For recovering from a runner that died holding it.
    pub async fn force_unlock(&self) -> Result<Option<LockHolder>> {
        let mut conn = self.pool.acquire().await?;
        self.lock.ensure_table(&mut conn).await?;
        let previous = self.lock.force_release(&mut conn).await?;
        if let Some(ref holder) = previous {
            warn!(
                holder = %holder.holder,
                since = %holder.acquired_at,
                "Migration lock force-released"
            );
        }
        Ok(previous)
    }
}

/// Number of ordered units up to and including `target`.
fn target_end(units: &[&MigrationUnit], target: Option<&str>) -> Result<usize> {
    match target {
        Some(name) => units
            .iter()
            .position(|u| u.name() == name)
            .map(|i| i + 1)
            .ok_or_else(|| MigrateError::UnknownMigration(name.to_string())),
        None => Ok(units.len()),
    }
}
