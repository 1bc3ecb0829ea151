//! Statement planner: turns a [`SchemaDelta`] into primitive store operations.

use std::fmt;

use log::debug;

use super::delta::{Converters, DeltaOperation, SchemaDelta};
use crate::core::{ColumnSpec, IndexSpec, MigrateError, MigrateResult};
use crate::storage::{LiveSchemaSnapshot, TableShape};

/// Desired final shape of a table rebuilt through a shadow copy.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildSpec {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub converters: Converters,
}

/// A single schema-altering statement issued to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveOp {
    AddColumn { table: String, column: ColumnSpec },
    /// Always issued as `CREATE TABLE IF NOT EXISTS`
    CreateTable { table: String, columns: Vec<ColumnSpec> },
    /// Always issued as `CREATE INDEX IF NOT EXISTS`
    CreateIndex(IndexSpec),
    RebuildTable(RebuildSpec),
    DropTable { table: String, if_exists: bool },
    RenameTable { from: String, to: String },
    Execute { sql: String },
}

impl PrimitiveOp {
    /// The table the operation is about, for audit output.
    pub fn table(&self) -> &str {
        match self {
            Self::AddColumn { table, .. } | Self::CreateTable { table, .. } | Self::DropTable { table, .. } => table,
            Self::CreateIndex(index) => &index.table,
            Self::RebuildTable(spec) => &spec.table,
            Self::RenameTable { from, .. } => from,
            Self::Execute { .. } => "-",
        }
    }

    /// Applies the operation to a snapshot without touching the store.
    pub fn simulate(&self, snapshot: &LiveSchemaSnapshot) -> LiveSchemaSnapshot {
        match self {
            Self::AddColumn { table, column } => snapshot.with_column(table, column.clone()),
            Self::CreateTable { table, columns } => snapshot.with_table(TableShape::new(table.clone(), columns.clone())),
            Self::CreateIndex(index) => snapshot.with_index(index.clone()),
            Self::RebuildTable(spec) => {
                if snapshot.has_table(&spec.table) {
                    snapshot.with_columns(&spec.table, spec.columns.clone())
                } else {
                    snapshot.with_table(TableShape::new(spec.table.clone(), spec.columns.clone()))
                }
            }
            Self::DropTable { table, .. } => snapshot.without_table(table),
            Self::RenameTable { from, to } => snapshot.renamed(from, to),
            Self::Execute { .. } => snapshot.clone(),
        }
    }
}

impl fmt::Display for PrimitiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddColumn { table, column } => write!(f, "ALTER TABLE {} ADD COLUMN {}", table, column),
            Self::CreateTable { table, columns } => {
                let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
                write!(f, "CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", "))
            }
            Self::CreateIndex(index) => write!(
                f,
                "CREATE {}INDEX IF NOT EXISTS {} ON {}({})",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                index.table,
                index.columns.join(", ")
            ),
            Self::RebuildTable(spec) => {
                let columns: Vec<String> = spec.columns.iter().map(|c| c.to_string()).collect();
                write!(f, "REBUILD TABLE {} ({})", spec.table, columns.join(", "))
            }
            Self::DropTable { table, if_exists } => {
                write!(f, "DROP TABLE {}{}", if *if_exists { "IF EXISTS " } else { "" }, table)
            }
            Self::RenameTable { from, to } => write!(f, "ALTER TABLE {} RENAME TO {}", from, to),
            Self::Execute { sql } => write!(f, "{}", sql),
        }
    }
}

fn invalid(delta: &SchemaDelta, reason: impl Into<String>) -> MigrateError {
    MigrateError::InvalidDelta {
        tag: delta.tag().to_string(),
        reason: reason.into(),
    }
}

fn check_distinct(delta: &SchemaDelta, columns: &[ColumnSpec]) -> MigrateResult<()> {
    if columns.is_empty() {
        return Err(invalid(delta, "column list is empty"));
    }
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].iter().any(|c| c.name.eq_ignore_ascii_case(&column.name)) {
            return Err(invalid(delta, format!("column '{}' listed twice", column.name)));
        }
    }
    Ok(())
}

fn rebuild(delta: &SchemaDelta, live: &TableShape, columns: Vec<ColumnSpec>) -> PrimitiveOp {
    PrimitiveOp::RebuildTable(RebuildSpec {
        table: live.name.clone(),
        columns,
        converters: delta.converters.clone(),
    })
}

/// Rebuilds are decided on column names, types and nullability, so a new
/// shape that differs only in defaults or key flags could never be applied.
fn check_rebuild_reaches(delta: &SchemaDelta, live: &TableShape, columns: &[ColumnSpec]) -> MigrateResult<()> {
    if live.same_columns(columns) && live.columns.as_slice() != columns {
        return Err(invalid(
            delta,
            format!(
                "'{}' differs only in defaults or key constraints; change a type, nullability or the column list",
                live.name
            ),
        ));
    }
    Ok(())
}

/// Produces the ordered operations that bring the live schema to the state
/// `delta` asks for.
///
/// An `add_column` whose column already exists plans to nothing.
pub fn plan(delta: &SchemaDelta, snapshot: &LiveSchemaSnapshot) -> MigrateResult<Vec<PrimitiveOp>> {
    if let DeltaOperation::Unsupported { tag } = &delta.operation {
        return Err(MigrateError::UnsupportedDeltaKind { tag: tag.clone() });
    }

    if let DeltaOperation::AddTable { columns } = &delta.operation {
        check_distinct(delta, columns)?;
        return Ok(vec![PrimitiveOp::CreateTable {
            table: delta.target_table.clone(),
            columns: columns.clone(),
        }]);
    }

    let live = snapshot
        .table(&delta.target_table)
        .ok_or_else(|| MigrateError::AmbiguousTarget {
            table: delta.target_table.clone(),
        })?;

    let ops = match &delta.operation {
        DeltaOperation::AddColumn { column } => {
            if live.has_column(&column.name) {
                debug!("{}: column already present, nothing to do", delta.describe());
                Vec::new()
            } else {
                vec![PrimitiveOp::AddColumn {
                    table: live.name.clone(),
                    column: column.clone(),
                }]
            }
        }
        DeltaOperation::AddIndex { name, columns, unique } => {
            if columns.is_empty() {
                return Err(invalid(delta, "index has no columns"));
            }
            if let Some(missing) = columns.iter().find(|c| !live.has_column(c)) {
                return Err(invalid(delta, format!("column '{}' not found on '{}'", missing, live.name)));
            }
            let mut index = IndexSpec::new(name.clone(), live.name.clone(), columns.clone());
            index.unique = *unique;
            vec![PrimitiveOp::CreateIndex(index)]
        }
        DeltaOperation::WidenColumn { column } => {
            if !live.has_column(&column.name) {
                return Err(invalid(delta, format!("column '{}' not found on '{}'", column.name, live.name)));
            }
            let columns = live
                .columns
                .iter()
                .map(|c| {
                    if c.name.eq_ignore_ascii_case(&column.name) {
                        column.clone()
                    } else {
                        c.clone()
                    }
                })
                .collect::<Vec<_>>();
            check_rebuild_reaches(delta, live, &columns)?;
            vec![rebuild(delta, live, columns)]
        }
        DeltaOperation::DropColumn { column } => {
            let columns: Vec<ColumnSpec> = live
                .columns
                .iter()
                .filter(|c| !c.name.eq_ignore_ascii_case(column))
                .cloned()
                .collect();
            if columns.is_empty() {
                return Err(invalid(delta, format!("cannot drop the last column of '{}'", live.name)));
            }
            vec![rebuild(delta, live, columns)]
        }
        DeltaOperation::ReshapeTable { columns } => {
            check_distinct(delta, columns)?;
            check_rebuild_reaches(delta, live, columns)?;
            vec![rebuild(delta, live, columns.clone())]
        }
        DeltaOperation::AddTable { .. } | DeltaOperation::Unsupported { .. } => Vec::new(),
    };

    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    fn snapshot() -> LiveSchemaSnapshot {
        LiveSchemaSnapshot::from_tables([TableShape::new(
            "AssetPart",
            vec![
                ColumnSpec::new("id", DataType::Text).primary_key(),
                ColumnSpec::new("assetId", DataType::Text).not_null(),
                ColumnSpec::new("createdById", DataType::Text).not_null(),
                ColumnSpec::new("quantity", DataType::Text),
            ],
        )])
    }

    #[test]
    fn test_add_existing_column_plans_nothing() {
        let delta = SchemaDelta::add_column("assetpart", ColumnSpec::new("QUANTITY", DataType::Integer));
        assert!(plan(&delta, &snapshot()).unwrap().is_empty());
    }

    #[test]
    fn test_add_missing_column() {
        let column = ColumnSpec::new("unitOfMeasure", DataType::Text).default_value("EA");
        let ops = plan(&SchemaDelta::add_column("AssetPart", column.clone()), &snapshot()).unwrap();
        assert_eq!(
            ops,
            vec![PrimitiveOp::AddColumn {
                table: "AssetPart".into(),
                column
            }]
        );
        assert_eq!(ops[0].to_string(), "ALTER TABLE AssetPart ADD COLUMN unitOfMeasure TEXT DEFAULT 'EA'");
    }

    #[test]
    fn test_add_table_is_unconditional() {
        let delta = SchemaDelta::add_table("AssetPart", vec![ColumnSpec::new("id", DataType::Text)]);
        let ops = plan(&delta, &snapshot()).unwrap();
        assert!(matches!(ops.as_slice(), [PrimitiveOp::CreateTable { .. }]));
    }

    #[test]
    fn test_widen_column_keeps_position() {
        let delta = SchemaDelta::widen_column("AssetPart", ColumnSpec::new("createdById", DataType::Text));
        let ops = plan(&delta, &snapshot()).unwrap();
        let [PrimitiveOp::RebuildTable(spec)] = ops.as_slice() else {
            panic!("expected a rebuild, got {:?}", ops);
        };
        assert_eq!(spec.columns[2].name, "createdById");
        assert!(spec.columns[2].nullable);
        assert_eq!(spec.columns.len(), 4);
    }

    #[test]
    fn test_drop_column_rebuilds_without_it() {
        let ops = plan(&SchemaDelta::drop_column("AssetPart", "quantity"), &snapshot()).unwrap();
        let [PrimitiveOp::RebuildTable(spec)] = ops.as_slice() else {
            panic!("expected a rebuild");
        };
        assert!(spec.columns.iter().all(|c| c.name != "quantity"));
    }

    #[test]
    fn test_missing_target_is_ambiguous() {
        let delta = SchemaDelta::add_column("Vendor", ColumnSpec::new("rating", DataType::Integer));
        let err = plan(&delta, &snapshot()).unwrap_err();
        assert_eq!(err, MigrateError::AmbiguousTarget { table: "Vendor".into() });
    }

    #[test]
    fn test_unsupported_kind() {
        let err = plan(&SchemaDelta::unsupported("AssetPart", "rename_column"), &snapshot()).unwrap_err();
        assert_eq!(err, MigrateError::UnsupportedDeltaKind { tag: "rename_column".into() });
    }

    #[test]
    fn test_index_on_unknown_column_is_invalid() {
        let delta = SchemaDelta::add_index("AssetPart", "idx_part_vendor", &["vendorId"]);
        assert!(matches!(plan(&delta, &snapshot()), Err(MigrateError::InvalidDelta { .. })));
    }

    #[test]
    fn test_constraint_only_change_is_rejected() {
        let mut columns = snapshot().table("AssetPart").unwrap().columns.clone();
        columns[3] = columns[3].clone().unique();
        let err = plan(&SchemaDelta::reshape_table("AssetPart", columns), &snapshot()).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidDelta { ref tag, .. } if tag == "reshape_table"));

        let new_default = ColumnSpec::new("quantity", DataType::Text).default_value("0");
        let err = plan(&SchemaDelta::widen_column("AssetPart", new_default), &snapshot()).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidDelta { .. }));
    }

    #[test]
    fn test_reshape_to_current_shape_plans_a_skippable_rebuild() {
        let columns = snapshot().table("AssetPart").unwrap().columns.clone();
        let ops = plan(&SchemaDelta::reshape_table("AssetPart", columns), &snapshot()).unwrap();
        assert!(!crate::migrate::checker::should_apply(&ops[0], &snapshot()));
    }

    #[test]
    fn test_constraint_rides_along_with_a_shape_change() {
        let column = ColumnSpec::new("quantity", DataType::Integer).unique();
        let ops = plan(&SchemaDelta::widen_column("AssetPart", column), &snapshot()).unwrap();
        let [PrimitiveOp::RebuildTable(spec)] = ops.as_slice() else {
            panic!("expected a rebuild");
        };
        assert!(spec.columns[3].unique);
    }
}
