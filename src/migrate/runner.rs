//! Migration runner: sequences migrations, keeps the ledger and reports.

use std::fmt;

use log::{error, info, warn};

use super::backfill::Backfill;
use super::checker::{check, Decision};
use super::ledger::{Ledger, MigrationRecord, MigrationStatus};
use super::planner::{plan, PrimitiveOp};
use super::rebuild::RebuildCoordinator;
use super::source::{Migration, MigrationStep};
use crate::connection::RunnerConfig;
use crate::core::{DbError, MigrateError, MigrateResult};
use crate::storage::{LiveSchemaSnapshot, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied,
    /// The ledger already holds an `applied` record for this name.
    AlreadyApplied,
    Failed,
    /// Dry run: every step was planned and checked, nothing was written.
    Planned,
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Applied => "applied",
            Self::AlreadyApplied => "already-applied",
            Self::Failed => "failed",
            Self::Planned => "planned",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub name: String,
    pub status: MigrationOutcome,
    pub statements_applied: usize,
    pub statements_skipped: usize,
    pub error: Option<String>,
    /// Applied under a different checksum than the current text.
    pub checksum_drift: bool,
    pub rows_backfilled: usize,
    pub rows_failed: usize,
}

impl MigrationReport {
    fn new(name: &str, status: MigrationOutcome) -> Self {
        Self {
            name: name.to_string(),
            status,
            statements_applied: 0,
            statements_skipped: 0,
            error: None,
            checksum_drift: false,
            rows_backfilled: 0,
            rows_failed: 0,
        }
    }

    fn fail(&mut self, err: &MigrateError) {
        self.status = MigrationOutcome::Failed;
        self.error = Some(err.to_string());
    }

    fn log_summary(&self) {
        match &self.error {
            Some(err) => error!(
                target: "audit",
                "migration={} status={} applied={} skipped={} error={}",
                self.name, self.status, self.statements_applied, self.statements_skipped, err
            ),
            None => info!(
                target: "audit",
                "migration={} status={} applied={} skipped={}",
                self.name, self.status, self.statements_applied, self.statements_skipped
            ),
        }
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<32} {:<16} applied={:<3} skipped={:<3}",
            self.name, self.status, self.statements_applied, self.statements_skipped
        )?;
        if self.rows_backfilled > 0 || self.rows_failed > 0 {
            write!(f, " rows={} rows_failed={}", self.rows_backfilled, self.rows_failed)?;
        }
        if self.checksum_drift {
            write!(f, " (checksum changed since applied)")?;
        }
        if let Some(err) = &self.error {
            write!(f, " error: {}", err)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub migrations: Vec<MigrationReport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.migrations.iter().any(|m| m.status == MigrationOutcome::Failed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.has_failures() { 1 } else { 0 }
    }

    pub fn get(&self, name: &str) -> Option<&MigrationReport> {
        self.migrations.iter().find(|m| m.name == name)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for migration in &self.migrations {
            writeln!(f, "{}", migration)?;
        }
        Ok(())
    }
}

/// How one primitive operation ended.
enum Applied {
    Yes,
    AlreadyThere(String),
}

fn audit(op: &dyn fmt::Display, table: &str, decision: &str) {
    info!(target: "audit", "op={} table={} decision={}", op, table, decision);
}

fn audit_failure(op: &dyn fmt::Display, table: &str, err: &MigrateError) {
    error!(target: "audit", "op={} table={} decision=failed error={}", op, table, err);
}

/// "Already exists" answers mean the target state is reached.
fn absorb(err: DbError) -> MigrateError {
    if err.is_already_exists() {
        MigrateError::AlreadyApplied { what: err.to_string() }
    } else {
        err.into()
    }
}

fn settle(migration: &Migration, result: MigrateResult<MigrationReport>) -> MigrationReport {
    let report = result.unwrap_or_else(|err| {
        let mut report = MigrationReport::new(&migration.name, MigrationOutcome::Failed);
        report.fail(&err);
        report
    });
    report.log_summary();
    report
}

pub struct MigrationRunner {
    store: Box<dyn Store>,
    config: RunnerConfig,
    ledger: Ledger,
}

impl MigrationRunner {
    pub fn new(store: Box<dyn Store>, config: RunnerConfig) -> MigrateResult<Self> {
        config.validate()?;
        let ledger = Ledger::new(config.ledger_table.clone());
        Ok(Self { store, config, ledger })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn Store {
        self.store.as_mut()
    }

    pub fn into_store(self) -> Box<dyn Store> {
        self.store
    }

    /// Every ledger record, oldest first.
    pub async fn status(&self) -> MigrateResult<Vec<MigrationRecord>> {
        self.ledger.records(self.store.as_ref()).await
    }

    /// Runs `migrations` in order.
    ///
    /// A failing migration is recorded and reported and the batch moves on;
    /// only an unusable ledger stops the run.
    pub async fn run(&mut self, migrations: &[Migration]) -> MigrateResult<RunReport> {
        let mut report = RunReport::default();

        if self.config.dry_run {
            let mut simulated = self.store.snapshot().await?;
            for migration in migrations {
                let result = self.plan_migration(migration, &mut simulated).await;
                report.migrations.push(settle(migration, result));
            }
            return Ok(report);
        }

        self.ledger.ensure(self.store.as_mut()).await?;
        for migration in migrations {
            let result = self.apply_migration(migration).await;
            report.migrations.push(settle(migration, result));
        }
        self.store.flush().await?;
        Ok(report)
    }

    /// Reports an already-applied migration, or `None` when it has to run.
    async fn already_applied(&mut self, migration: &Migration, checksum: &str) -> MigrateResult<Option<MigrationReport>> {
        let Some(mut latest) = self.ledger.latest(self.store.as_ref(), &migration.name).await? else {
            return Ok(None);
        };

        match latest.status {
            MigrationStatus::Applied => {
                let mut report = MigrationReport::new(&migration.name, MigrationOutcome::AlreadyApplied);
                report.statements_skipped = migration.len();
                if latest.checksum != checksum {
                    warn!(
                        "migration={} was applied with checksum {} but its text now hashes to {}",
                        migration.name, latest.checksum, checksum
                    );
                    report.checksum_drift = true;
                }
                info!("migration={} already applied at {:?}, skipping", migration.name, latest.applied_at);
                Ok(Some(report))
            }
            MigrationStatus::Pending if !self.config.dry_run => {
                warn!("migration={} left pending by an earlier run, marking it failed", migration.name);
                self.ledger
                    .finish(
                        self.store.as_mut(),
                        &mut latest,
                        MigrationStatus::Failed,
                        Some("interrupted before completion".to_string()),
                    )
                    .await?;
                Ok(None)
            }
            MigrationStatus::Pending | MigrationStatus::Failed => Ok(None),
        }
    }

    async fn apply_migration(&mut self, migration: &Migration) -> MigrateResult<MigrationReport> {
        let checksum = migration.checksum();
        if let Some(report) = self.already_applied(migration, &checksum).await? {
            return Ok(report);
        }

        let mut record = self.ledger.begin(self.store.as_mut(), &migration.name, &checksum).await?;
        let mut report = MigrationReport::new(&migration.name, MigrationOutcome::Applied);

        let mut outcome = match migration.load_error() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        };
        for step in &migration.steps {
            if outcome.is_err() {
                break;
            }
            outcome = self.apply_step(step, &mut report).await;
        }

        match outcome {
            Ok(()) => {
                self.ledger
                    .finish(self.store.as_mut(), &mut record, MigrationStatus::Applied, None)
                    .await?;
            }
            Err(err) => {
                report.fail(&err);
                self.ledger
                    .finish(self.store.as_mut(), &mut record, MigrationStatus::Failed, Some(err.to_string()))
                    .await?;
            }
        }
        Ok(report)
    }

    async fn apply_step(&mut self, step: &MigrationStep, report: &mut MigrationReport) -> MigrateResult<()> {
        match step {
            MigrationStep::Delta(delta) => {
                let snapshot = self.store.snapshot().await?;
                let ops = plan(delta, &snapshot).inspect_err(|err| audit_failure(&delta.describe(), &delta.target_table, err))?;
                if ops.is_empty() {
                    audit(&delta.describe(), &delta.target_table, "skipped");
                    report.statements_skipped += 1;
                }
                for op in &ops {
                    self.apply_op(op, report).await?;
                }
                Ok(())
            }
            MigrationStep::Primitive(op) => self.apply_op(op, report).await,
            MigrationStep::Backfill(backfill) => self.apply_backfill(backfill, report).await,
        }
    }

    /// Checks `op` against a fresh snapshot and issues it when needed.
    async fn apply_op(&mut self, op: &PrimitiveOp, report: &mut MigrationReport) -> MigrateResult<()> {
        let snapshot = self.store.snapshot().await?;
        if let Decision::Skip { .. } = check(op, &snapshot) {
            audit(op, op.table(), "skipped");
            report.statements_skipped += 1;
            return Ok(());
        }

        match self.execute_op(op).await {
            Ok(Applied::Yes) => {
                audit(op, op.table(), "applied");
                report.statements_applied += 1;
                Ok(())
            }
            Ok(Applied::AlreadyThere(what)) => {
                info!("op={} already in place: {}", op, what);
                audit(op, op.table(), "already-applied");
                report.statements_skipped += 1;
                Ok(())
            }
            Err(err) => {
                audit_failure(op, op.table(), &err);
                Err(err)
            }
        }
    }

    async fn execute_op(&mut self, op: &PrimitiveOp) -> MigrateResult<Applied> {
        let result = match op {
            PrimitiveOp::AddColumn { table, column } => self.store.add_column(table, column.clone()).await.map(|_| true),
            PrimitiveOp::CreateTable { table, columns } => self.store.create_table(table, columns.clone(), true).await,
            PrimitiveOp::CreateIndex(index) => self.store.create_index(index.clone(), true).await,
            PrimitiveOp::RebuildTable(spec) => {
                let mut coordinator = RebuildCoordinator::new(self.store.as_mut(), &self.config.shadow_suffix);
                let outcome = coordinator.rebuild(spec).await?;
                info!(
                    "rebuilt {}: copied={} indexes={} recovered={}",
                    spec.table, outcome.rows_copied, outcome.indexes_recreated, outcome.recovered
                );
                return Ok(Applied::Yes);
            }
            PrimitiveOp::DropTable { table, .. } => self.store.drop_table(table).await.map(|_| true),
            PrimitiveOp::RenameTable { from, to } => self.store.rename_table(from, to).await.map(|_| true),
            PrimitiveOp::Execute { sql } => self.store.execute_sql(sql).await.map(|_| true),
        };

        match result.map_err(absorb) {
            Ok(true) => Ok(Applied::Yes),
            Ok(false) => Ok(Applied::AlreadyThere(format!("{} already exists", op.table()))),
            Err(MigrateError::AlreadyApplied { what }) => Ok(Applied::AlreadyThere(what)),
            Err(err) => Err(err),
        }
    }

    async fn apply_backfill(&mut self, backfill: &Backfill, report: &mut MigrationReport) -> MigrateResult<()> {
        let outcome = backfill
            .execute(self.store.as_mut())
            .await
            .inspect_err(|err| audit_failure(&backfill.describe(), &backfill.table, err))?;
        audit(&backfill.describe(), &backfill.table, "applied");
        report.statements_applied += 1;
        report.rows_backfilled += outcome.rows_updated;
        report.rows_failed += outcome.rows_failed;
        Ok(())
    }

    /// Dry run of one migration against `simulated`, which carries the
    /// effect of earlier planned migrations.
    async fn plan_migration(
        &mut self,
        migration: &Migration,
        simulated: &mut LiveSchemaSnapshot,
    ) -> MigrateResult<MigrationReport> {
        let checksum = migration.checksum();
        if let Some(report) = self.already_applied(migration, &checksum).await? {
            return Ok(report);
        }

        let mut report = MigrationReport::new(&migration.name, MigrationOutcome::Planned);
        if let Some(err) = migration.load_error() {
            report.fail(err);
            return Ok(report);
        }
        for step in &migration.steps {
            let ops = match step {
                MigrationStep::Delta(delta) => match plan(delta, simulated) {
                    Ok(ops) if ops.is_empty() => {
                        audit(&delta.describe(), &delta.target_table, "skipped");
                        report.statements_skipped += 1;
                        continue;
                    }
                    Ok(ops) => ops,
                    Err(err) => {
                        audit_failure(&delta.describe(), &delta.target_table, &err);
                        report.fail(&err);
                        return Ok(report);
                    }
                },
                MigrationStep::Primitive(op) => vec![op.clone()],
                MigrationStep::Backfill(backfill) => {
                    audit(&backfill.describe(), &backfill.table, "would-apply");
                    report.statements_applied += 1;
                    continue;
                }
            };

            for op in &ops {
                if check(op, simulated).is_apply() {
                    audit(op, op.table(), "would-apply");
                    *simulated = op.simulate(simulated);
                    report.statements_applied += 1;
                } else {
                    audit(op, op.table(), "skipped");
                    report.statements_skipped += 1;
                }
            }
        }
        Ok(report)
    }
}
