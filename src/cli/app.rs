use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use log::info;

use cmms_migrate::connection::config::{ConnectionConfig, RunnerConfig};
use cmms_migrate::connection::open_store;
use cmms_migrate::migrate::{load_directory, MigrationRunner};
use cmms_migrate::storage::Store;

use super::args::{parse_target, Cli, Command};

pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    pub async fn run(&self) -> Result<ExitCode> {
        let config = ConnectionConfig::from_url(&self.cli.database_url).context("Invalid database URL")?;
        let store = open_store(&config).with_context(|| format!("Failed to open store {}", config))?;

        match &self.cli.command {
            Command::Run { dir, dry_run } => self.migrate(store, dir, *dry_run).await,
            Command::Plan { dir } => self.migrate(store, dir, true).await,
            Command::Status => self.status(store).await,
            Command::Verify { targets } => verify(store.as_ref(), targets).await,
        }
    }

    fn runner_config(&self, dry_run: bool) -> RunnerConfig {
        RunnerConfig::new().dry_run(dry_run).ledger_table(&self.cli.ledger_table)
    }

    async fn migrate(&self, store: Box<dyn Store>, dir: &Path, dry_run: bool) -> Result<ExitCode> {
        let migrations = load_directory(dir)
            .with_context(|| format!("Failed to load migrations from '{}'", dir.display()))?;
        if migrations.is_empty() {
            println!("No migrations found in {}", dir.display());
            return Ok(ExitCode::SUCCESS);
        }
        info!("Loaded {} migrations from {}", migrations.len(), dir.display());

        let mut runner = MigrationRunner::new(store, self.runner_config(dry_run))?;
        let report = runner.run(&migrations).await.context("Migration run aborted")?;

        print!("{}", report);
        if report.has_failures() {
            Ok(ExitCode::FAILURE)
        } else {
            Ok(ExitCode::SUCCESS)
        }
    }

    async fn status(&self, store: Box<dyn Store>) -> Result<ExitCode> {
        let runner = MigrationRunner::new(store, self.runner_config(false))?;
        let records = runner.status().await.context("Failed to read the migration ledger")?;
        if records.is_empty() {
            println!("No migrations recorded");
            return Ok(ExitCode::SUCCESS);
        }

        println!("{:>4}  {:<32} {:<8} {:<20} checksum", "id", "name", "status", "applied_at");
        for record in records {
            let applied_at = record
                .applied_at
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:>4}  {:<32} {:<8} {:<20} {}",
                record.id,
                record.name,
                record.status.as_str(),
                applied_at,
                record.checksum.get(..12).unwrap_or(&record.checksum)
            );
            if let Some(error) = &record.error {
                println!("      error: {}", error);
            }
        }
        Ok(ExitCode::SUCCESS)
    }
}

async fn verify(store: &dyn Store, targets: &[String]) -> Result<ExitCode> {
    let snapshot = store.snapshot().await.context("Failed to read schema")?;

    let mut missing = 0;
    for target in targets {
        let found = match parse_target(target) {
            (table, Some(column)) => snapshot.has_column(table, column),
            (table, None) => snapshot.has_table(table),
        };
        if found {
            println!("ok       {}", target);
        } else {
            println!("missing  {}", target);
            missing += 1;
        }
    }

    if missing > 0 {
        println!("{} of {} missing", missing, targets.len());
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
