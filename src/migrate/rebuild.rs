//! Table rebuild through a shadow copy, for changes the store cannot make in place.
//!
//! ```text
//! START -> COPYING -> VERIFYING -> SWAPPING -> DONE
//!                         \
//!                          -> FAILED (original and shadow both kept)
//! ```
//!
//! SWAPPING drops the original and renames the shadow over it. Between those
//! two calls the table is briefly absent; run rebuilds in a maintenance window
//! when that matters. A run interrupted inside that window is finished by the
//! next rebuild of the same table, which finds only the shadow and renames it.

use std::fmt;

use log::{debug, warn};

use super::planner::RebuildSpec;
use crate::core::{ColumnSpec, MigrateError, MigrateResult, Row, Value};
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    Start,
    Copying,
    Verifying,
    Swapping,
    Done,
    Failed,
}

impl fmt::Display for RebuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::Copying => "COPYING",
            Self::Verifying => "VERIFYING",
            Self::Swapping => "SWAPPING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildOutcome {
    pub rows_copied: usize,
    pub rows_rejected: usize,
    pub indexes_recreated: usize,
    /// The shadow of an interrupted swap was renamed into place; no copy ran.
    pub recovered: bool,
}

pub struct RebuildCoordinator<'a> {
    store: &'a mut dyn Store,
    shadow_suffix: &'a str,
    state: RebuildState,
}

impl<'a> RebuildCoordinator<'a> {
    pub fn new(store: &'a mut dyn Store, shadow_suffix: &'a str) -> Self {
        Self {
            store,
            shadow_suffix,
            state: RebuildState::Start,
        }
    }

    pub fn state(&self) -> RebuildState {
        self.state
    }

    pub fn shadow_name(&self, table: &str) -> String {
        format!("{}{}", table, self.shadow_suffix)
    }

    fn transition(&mut self, table: &str, next: RebuildState) {
        debug!("rebuild table={} state={} -> {}", table, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, table: &str, err: MigrateError) -> MigrateError {
        self.transition(table, RebuildState::Failed);
        err
    }

    pub async fn rebuild(&mut self, spec: &RebuildSpec) -> MigrateResult<RebuildOutcome> {
        let table = spec.table.as_str();
        let shadow = self.shadow_name(table);

        let snapshot = self.store.snapshot().await?;
        let original = snapshot.table(table).cloned();

        let Some(original) = original else {
            if snapshot.has_table(&shadow) {
                warn!("rebuild table={}: original missing, completing interrupted swap from {}", table, shadow);
                self.transition(table, RebuildState::Swapping);
                if let Err(e) = self.store.rename_table(&shadow, table).await {
                    return Err(self.fail(table, e.into()));
                }
                self.transition(table, RebuildState::Done);
                return Ok(RebuildOutcome {
                    recovered: true,
                    ..Default::default()
                });
            }
            return Err(self.fail(
                table,
                MigrateError::AmbiguousTarget {
                    table: table.to_string(),
                },
            ));
        };

        if snapshot.has_table(&shadow) {
            return Err(self.fail(
                table,
                MigrateError::ShadowTableExists {
                    table: table.to_string(),
                    shadow,
                },
            ));
        }

        // START
        if let Err(e) = self.store.create_table(&shadow, spec.columns.clone(), false).await {
            return Err(self.fail(table, e.into()));
        }

        self.transition(table, RebuildState::Copying);
        let mut outcome = RebuildOutcome::default();
        let rows = match self.store.scan(&original.name).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.fail(table, e.into())),
        };
        for (row_id, row) in rows {
            let copied = match map_row(spec, &original.columns, &row) {
                Ok(mapped) => self.store.insert_row(&shadow, mapped).await.map_err(MigrateError::from),
                Err(e) => Err(e),
            };
            match copied {
                Ok(_) => outcome.rows_copied += 1,
                Err(e) if e.is_transient() => return Err(self.fail(table, e)),
                Err(e) => {
                    warn!("rebuild table={} row={} rejected: {}", table, row_id, e);
                    outcome.rows_rejected += 1;
                }
            }
        }

        if let Err(e) = self.store.flush().await {
            return Err(self.fail(table, e.into()));
        }

        self.transition(table, RebuildState::Verifying);
        let counts = match self.store.row_count(&original.name).await {
            Ok(original_rows) => self.store.row_count(&shadow).await.map(|shadow_rows| (original_rows, shadow_rows)),
            Err(e) => Err(e),
        };
        let (original_rows, shadow_rows) = match counts {
            Ok(counts) => counts,
            Err(e) => return Err(self.fail(table, e.into())),
        };
        if original_rows != shadow_rows {
            return Err(self.fail(
                table,
                MigrateError::RebuildVerificationFailed {
                    table: table.to_string(),
                    original_rows,
                    shadow_rows,
                    rejected: outcome.rows_rejected,
                },
            ));
        }

        self.transition(table, RebuildState::Swapping);
        if let Err(e) = self.store.drop_table(&original.name).await {
            return Err(self.fail(table, e.into()));
        }
        if let Err(e) = self.store.rename_table(&shadow, &original.name).await {
            return Err(self.fail(table, e.into()));
        }

        for index in &original.indexes {
            let survives = index
                .columns
                .iter()
                .all(|c| spec.columns.iter().any(|col| col.name.eq_ignore_ascii_case(c)));
            if !survives {
                debug!("rebuild table={}: not recreating index {}", table, index.name);
                continue;
            }
            let mut recreated = index.clone();
            recreated.table = original.name.clone();
            match self.store.create_index(recreated, true).await {
                Ok(_) => outcome.indexes_recreated += 1,
                Err(e) => warn!("rebuild table={}: could not recreate index {}: {}", table, index.name, e),
            }
        }

        self.transition(table, RebuildState::Done);
        Ok(outcome)
    }
}

/// Lays an original row out in the rebuilt column order.
///
/// Columns new to the table are left `NULL` so the store fills their default.
fn map_row(spec: &RebuildSpec, old_columns: &[ColumnSpec], row: &Row) -> MigrateResult<Row> {
    spec.columns
        .iter()
        .map(|column| {
            let Some(pos) = old_columns.iter().position(|c| c.name.eq_ignore_ascii_case(&column.name)) else {
                return Ok(Value::Null);
            };
            let value = &row[pos];
            match spec.converters.get(&column.name) {
                Some(convert) => convert(value),
                None => value.cast_to(&column.data_type).map_err(MigrateError::from),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::storage::InMemoryStore;

    async fn part_store(rows: &[(&str, &str)]) -> InMemoryStore {
        let mut store = InMemoryStore::new();
        store
            .create_table(
                "Part",
                vec![
                    ColumnSpec::new("id", DataType::Text).primary_key(),
                    ColumnSpec::new("quantity", DataType::Text).not_null(),
                ],
                false,
            )
            .await
            .unwrap();
        for (id, qty) in rows {
            store.insert_row("Part", vec![(*id).into(), (*qty).into()]).await.unwrap();
        }
        store
    }

    fn integer_quantity() -> RebuildSpec {
        RebuildSpec {
            table: "Part".into(),
            columns: vec![
                ColumnSpec::new("id", DataType::Text).primary_key(),
                ColumnSpec::new("quantity", DataType::Integer),
                ColumnSpec::new("unitOfMeasure", DataType::Text).default_value("EA"),
            ],
            converters: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_rebuild_copies_and_swaps() {
        let mut store = part_store(&[("p1", "4"), ("p2", "10")]).await;
        let mut coordinator = RebuildCoordinator::new(&mut store, "__shadow");
        let outcome = coordinator.rebuild(&integer_quantity()).await.unwrap();
        assert_eq!(coordinator.state(), RebuildState::Done);
        assert_eq!(outcome.rows_copied, 2);

        let snapshot = store.snapshot().await.unwrap();
        assert!(!snapshot.has_table("Part__shadow"));
        assert!(snapshot.table("Part").unwrap().same_columns(&integer_quantity().columns));

        let rows = store.scan("Part").await.unwrap();
        assert_eq!(rows[0].1, vec![Value::Text("p1".into()), Value::Integer(4), Value::Text("EA".into())]);
    }

    #[tokio::test]
    async fn test_verification_failure_keeps_both_tables() {
        let mut store = part_store(&[("p1", "4"), ("p2", "a dozen"), ("p3", "7")]).await;
        let mut coordinator = RebuildCoordinator::new(&mut store, "__shadow");
        let err = coordinator.rebuild(&integer_quantity()).await.unwrap_err();
        assert_eq!(coordinator.state(), RebuildState::Failed);
        assert_eq!(
            err,
            MigrateError::RebuildVerificationFailed {
                table: "Part".into(),
                original_rows: 3,
                shadow_rows: 2,
                rejected: 1,
            }
        );

        assert_eq!(store.row_count("Part").await.unwrap(), 3);
        assert_eq!(store.row_count("Part__shadow").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_converter_overrides_default_coercion() {
        let mut store = part_store(&[("p1", "4"), ("p2", "a dozen")]).await;
        let mut spec = integer_quantity();
        spec.converters.insert(
            "quantity",
            std::sync::Arc::new(|v: &Value| -> MigrateResult<Value> {
                match v.as_str() {
                    Some("a dozen") => Ok(Value::Integer(12)),
                    _ => Ok(v.cast_to(&DataType::Integer)?),
                }
            }),
        );

        let outcome = RebuildCoordinator::new(&mut store, "__shadow").rebuild(&spec).await.unwrap();
        assert_eq!(outcome.rows_rejected, 0);
        let rows = store.scan("Part").await.unwrap();
        assert_eq!(rows[1].1[1], Value::Integer(12));
    }

    #[tokio::test]
    async fn test_existing_shadow_is_never_dropped() {
        let mut store = part_store(&[("p1", "4")]).await;
        store
            .create_table("Part__shadow", vec![ColumnSpec::new("id", DataType::Text)], false)
            .await
            .unwrap();

        let err = RebuildCoordinator::new(&mut store, "__shadow")
            .rebuild(&integer_quantity())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ShadowTableExists { .. }));
        assert!(store.snapshot().await.unwrap().has_table("Part__shadow"));
    }

    #[tokio::test]
    async fn test_interrupted_swap_is_completed() {
        let mut store = part_store(&[("p1", "4")]).await;
        store.rename_table("Part", "Part__shadow").await.unwrap();

        let outcome = RebuildCoordinator::new(&mut store, "__shadow")
            .rebuild(&integer_quantity())
            .await
            .unwrap();
        assert!(outcome.recovered);
        assert_eq!(store.row_count("Part").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_surviving_indexes_are_recreated() {
        let mut store = part_store(&[("p1", "4")]).await;
        store
            .create_index(crate::core::IndexSpec::new("idx_part_qty", "Part", vec!["quantity".into()]), false)
            .await
            .unwrap();

        let outcome = RebuildCoordinator::new(&mut store, "__shadow")
            .rebuild(&integer_quantity())
            .await
            .unwrap();
        assert_eq!(outcome.indexes_recreated, 1);
        assert!(store.snapshot().await.unwrap().has_index("idx_part_qty"));
    }
}
