// ============================================================================
// cmms-migrate library
// ============================================================================

pub mod connection;
pub mod core;
pub mod migrate;
pub mod parser;
pub mod storage;

// Re-export main types for convenience
pub use core::{ColumnSpec, Condition, DataType, DbError, IndexSpec, MigrateError, MigrateResult, Value};
pub use storage::{InMemoryStore, LiveSchemaSnapshot, Store};

// Re-export the engine API
pub use connection::{
    config::{ConnectionConfig, RunnerConfig},
    open_store,
};
pub use migrate::{
    Backfill, Migration, MigrationOutcome, MigrationReport, MigrationRunner, RowRule, RunReport, SchemaDelta,
    load_directory,
};
