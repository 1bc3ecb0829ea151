use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cmms_migrate::connection::config::DEFAULT_LEDGER_TABLE;

#[derive(Parser, Debug)]
#[command(name = "cmms-migrate")]
#[command(about = "Safe, idempotent schema migrations and backfills")]
pub struct Cli {
    /// Store to migrate: memory://<name> or file://<path>
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Table holding the migration ledger
    #[arg(long, global = true, default_value = DEFAULT_LEDGER_TABLE)]
    pub ledger_table: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply the migrations of a directory in order
    Run {
        #[arg(long)]
        dir: PathBuf,
        /// Plan and check every step without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Same as `run --dry-run`
    Plan {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Print the migration ledger
    Status,
    /// Check that each TABLE or TABLE.COLUMN exists
    Verify {
        #[arg(required = true, value_name = "TABLE[.COLUMN]")]
        targets: Vec<String>,
    },
}

/// Splits `Table.column` into its parts.
pub fn parse_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('.') {
        Some((table, column)) => (table, Some(column)),
        None => (target, None),
    }
}
