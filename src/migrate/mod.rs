//! The migration engine.
//!
//! Control flows runner -> planner -> checker -> (in-place operation or
//! rebuild coordinator) -> backfill, one awaited store call at a time.

pub mod backfill;
pub mod checker;
pub mod delta;
pub mod ledger;
pub mod planner;
pub mod rebuild;
pub mod runner;
pub mod source;

pub use backfill::{Backfill, BackfillOutcome, CaseArm, RowFailure, RowPredicate, RowRule, RowView};
pub use checker::{check, should_apply, Decision};
pub use delta::{ColumnConverter, Converters, DeltaOperation, SchemaDelta};
pub use ledger::{Ledger, MigrationRecord, MigrationStatus};
pub use planner::{plan, PrimitiveOp, RebuildSpec};
pub use rebuild::{RebuildCoordinator, RebuildOutcome, RebuildState};
pub use runner::{MigrationOutcome, MigrationReport, MigrationRunner, RunReport};
pub use source::{load_directory, steps_from_sql, Migration, MigrationStep};
