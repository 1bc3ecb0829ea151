//! Backfill executor: row-level data population after a schema change.

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;

use crate::core::{ColumnSpec, Condition, Literal, MigrateError, MigrateResult, Row, RowId, Value};
use crate::storage::Store;

/// Read access to one row by column name.
pub struct RowView<'a> {
    columns: &'a [ColumnSpec],
    row: &'a Row,
}

impl<'a> RowView<'a> {
    pub fn new(columns: &'a [ColumnSpec], row: &'a Row) -> Self {
        Self { columns, row }
    }

    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .map(|i| &self.row[i])
    }

    pub fn matches(&self, condition: &Condition) -> MigrateResult<bool> {
        Ok(condition.matches(self.columns, self.row)?)
    }
}

pub type RowFn = Arc<dyn Fn(&RowView<'_>) -> MigrateResult<Value> + Send + Sync>;
pub type RowPredicateFn = Arc<dyn Fn(&RowView<'_>) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaseArm {
    pub when: Condition,
    pub then: Literal,
}

/// How the new value of a row is computed. Rules must depend only on the
/// row's current state so that re-running a backfill rewrites nothing.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRule {
    Constant(Literal),
    CopyColumn(String),
    /// First matching arm wins; rows matching no arm keep their value unless
    /// `otherwise` is given.
    Case {
        arms: Vec<CaseArm>,
        #[serde(default)]
        otherwise: Option<Literal>,
    },
    #[serde(skip)]
    Custom(RowFn),
}

impl RowRule {
    /// `None` leaves the row untouched.
    fn evaluate(&self, row: &RowView<'_>) -> MigrateResult<Option<Value>> {
        match self {
            Self::Constant(literal) => Ok(Some(literal.0.clone())),
            Self::CopyColumn(column) => row
                .get(column)
                .cloned()
                .map(Some)
                .ok_or_else(|| MigrateError::Source(format!("copy_column: unknown column '{}'", column))),
            Self::Case { arms, otherwise } => {
                for arm in arms {
                    if row.matches(&arm.when)? {
                        return Ok(Some(arm.then.0.clone()));
                    }
                }
                Ok(otherwise.as_ref().map(|l| l.0.clone()))
            }
            Self::Custom(rule) => rule(row).map(Some),
        }
    }
}

impl fmt::Debug for RowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(literal) => f.debug_tuple("Constant").field(&literal.0).finish(),
            Self::CopyColumn(column) => f.debug_tuple("CopyColumn").field(column).finish(),
            Self::Case { arms, otherwise } => f
                .debug_struct("Case")
                .field("arms", arms)
                .field("otherwise", otherwise)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Clone)]
pub enum RowPredicate {
    Matches(Condition),
    Custom(RowPredicateFn),
}

impl RowPredicate {
    fn test(&self, row: &RowView<'_>) -> MigrateResult<bool> {
        match self {
            Self::Matches(condition) => row.matches(condition),
            Self::Custom(predicate) => Ok(predicate(row)),
        }
    }
}

impl fmt::Debug for RowPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matches(condition) => f.debug_tuple("Matches").field(condition).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub row_id: RowId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillOutcome {
    pub rows_updated: usize,
    /// Rows that matched but already held the computed value.
    pub rows_unchanged: usize,
    pub rows_failed: usize,
    pub failures: Vec<RowFailure>,
}

/// Populates `column` of every row of `table` matching the predicate.
#[derive(Debug, Clone)]
pub struct Backfill {
    pub table: String,
    pub column: String,
    pub rule: RowRule,
    pub predicate: Option<RowPredicate>,
}

#[derive(Deserialize)]
struct BackfillDef {
    table: String,
    column: String,
    rule: RowRule,
    #[serde(default, rename = "where")]
    condition: Option<Condition>,
}

impl Backfill {
    pub fn new(table: impl Into<String>, column: impl Into<String>, rule: RowRule) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            rule,
            predicate: None,
        }
    }

    pub fn with_rule<F>(table: impl Into<String>, column: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&RowView<'_>) -> MigrateResult<Value> + Send + Sync + 'static,
    {
        Self::new(table, column, RowRule::Custom(Arc::new(rule)))
    }

    pub fn only_where(mut self, condition: Condition) -> Self {
        self.predicate = Some(RowPredicate::Matches(condition));
        self
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RowView<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(RowPredicate::Custom(Arc::new(predicate)));
        self
    }

    /// Reads `{"table": .., "column": .., "rule": .., "where": ..}`.
    pub fn from_json(raw: serde_json::Value) -> MigrateResult<Self> {
        let def: BackfillDef =
            serde_json::from_value(raw).map_err(|e| MigrateError::Source(format!("invalid backfill: {}", e)))?;
        let backfill = Self::new(def.table, def.column, def.rule);
        Ok(match def.condition {
            Some(condition) => backfill.only_where(condition),
            None => backfill,
        })
    }

    pub fn describe(&self) -> String {
        let mut text = format!("backfill({}.{} = {:?}", self.table, self.column, self.rule);
        if let Some(predicate) = &self.predicate {
            text.push_str(&format!(" where {:?}", predicate));
        }
        text.push(')');
        text
    }

    /// Visits matching rows one at a time and writes the computed value.
    ///
    /// A row whose value would not change is not written, so re-running after
    /// an interruption only touches the rows still to do. A failing row is
    /// recorded and the rest continue; a transient store error stops the pass.
    pub async fn execute(&self, store: &mut dyn Store) -> MigrateResult<BackfillOutcome> {
        let snapshot = store.snapshot().await?;
        let shape = snapshot
            .table(&self.table)
            .ok_or_else(|| MigrateError::AmbiguousTarget {
                table: self.table.clone(),
            })?;
        let target = shape
            .column(&self.column)
            .cloned()
            .ok_or_else(|| MigrateError::Source(format!("backfill column {}.{} not found", self.table, self.column)))?;
        let columns = shape.columns.clone();

        let mut outcome = BackfillOutcome::default();
        for (row_id, row) in store.scan(&self.table).await? {
            let view = RowView::new(&columns, &row);
            let result = self.compute(&view, &target);

            let value = match result {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    record_failure(&mut outcome, &self.table, row_id, e);
                    continue;
                }
            };

            if view.get(&target.name) == Some(&value) {
                outcome.rows_unchanged += 1;
                continue;
            }

            match store.update_value(&self.table, row_id, &target.name, value).await {
                Ok(()) => outcome.rows_updated += 1,
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => record_failure(&mut outcome, &self.table, row_id, e.into()),
            }
        }
        store.flush().await?;

        info!(
            "backfill {}.{}: updated={} unchanged={} failed={}",
            self.table, self.column, outcome.rows_updated, outcome.rows_unchanged, outcome.rows_failed
        );
        Ok(outcome)
    }

    /// The value to store, coerced to the column type; `None` skips the row.
    fn compute(&self, view: &RowView<'_>, target: &ColumnSpec) -> MigrateResult<Option<Value>> {
        if let Some(predicate) = &self.predicate {
            if !predicate.test(view)? {
                return Ok(None);
            }
        }
        match self.rule.evaluate(view)? {
            Some(value) => Ok(Some(value.cast_to(&target.data_type)?)),
            None => Ok(None),
        }
    }
}

fn record_failure(outcome: &mut BackfillOutcome, table: &str, row_id: RowId, error: MigrateError) {
    warn!("backfill {} row={} failed: {}", table, row_id, error);
    outcome.rows_failed += 1;
    outcome.failures.push(RowFailure {
        row_id,
        error: error.to_string(),
    });
}
