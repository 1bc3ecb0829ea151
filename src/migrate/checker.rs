//! Idempotency checker: decides apply-vs-skip for each primitive operation
//! from a fresh snapshot. Never touches the store.

use log::debug;

use super::planner::PrimitiveOp;
use crate::storage::LiveSchemaSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Skip { reason: String },
}

impl Decision {
    pub fn is_apply(&self) -> bool {
        matches!(self, Self::Apply)
    }
}

fn skip(reason: impl Into<String>) -> Decision {
    Decision::Skip { reason: reason.into() }
}

/// Why `op` should or should not be issued against `snapshot`.
pub fn check(op: &PrimitiveOp, snapshot: &LiveSchemaSnapshot) -> Decision {
    let decision = match op {
        PrimitiveOp::AddColumn { table, column } => {
            if snapshot.has_column(table, &column.name) {
                skip(format!("column {}.{} already exists", table, column.name))
            } else {
                Decision::Apply
            }
        }
        // IF NOT EXISTS makes these safe to issue every time.
        PrimitiveOp::CreateTable { .. } | PrimitiveOp::CreateIndex(_) => Decision::Apply,
        PrimitiveOp::RebuildTable(spec) => match snapshot.table(&spec.table) {
            Some(live) if live.same_columns(&spec.columns) => {
                skip(format!("{} already has the desired columns", live.name))
            }
            _ => Decision::Apply,
        },
        PrimitiveOp::DropTable { table, .. } => {
            if snapshot.has_table(table) {
                Decision::Apply
            } else {
                skip(format!("table {} does not exist", table))
            }
        }
        PrimitiveOp::RenameTable { from, to } => {
            if !snapshot.has_table(from) && snapshot.has_table(to) {
                skip(format!("{} already renamed to {}", from, to))
            } else {
                Decision::Apply
            }
        }
        PrimitiveOp::Execute { .. } => Decision::Apply,
    };

    debug!("check `{}` on {}: {:?}", op, op.table(), decision);
    decision
}

pub fn should_apply(op: &PrimitiveOp, snapshot: &LiveSchemaSnapshot) -> bool {
    check(op, snapshot).is_apply()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnSpec, DataType, IndexSpec};
    use crate::migrate::planner::RebuildSpec;
    use crate::storage::TableShape;

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", DataType::Text).primary_key(),
            ColumnSpec::new("createdById", DataType::Text).not_null(),
        ]
    }

    fn snapshot() -> LiveSchemaSnapshot {
        LiveSchemaSnapshot::from_tables([TableShape::new("AssetPart", columns())])
    }

    fn rebuild_to(columns: Vec<ColumnSpec>) -> PrimitiveOp {
        PrimitiveOp::RebuildTable(RebuildSpec {
            table: "AssetPart".into(),
            columns,
            converters: Default::default(),
        })
    }

    #[test]
    fn test_add_column_checks_existence() {
        let existing = PrimitiveOp::AddColumn {
            table: "AssetPart".into(),
            column: ColumnSpec::new("createdbyid", DataType::Text),
        };
        assert!(!should_apply(&existing, &snapshot()));

        let missing = PrimitiveOp::AddColumn {
            table: "AssetPart".into(),
            column: ColumnSpec::new("notes", DataType::Text),
        };
        assert!(should_apply(&missing, &snapshot()));
    }

    #[test]
    fn test_create_ops_always_apply() {
        let create = PrimitiveOp::CreateTable {
            table: "AssetPart".into(),
            columns: columns(),
        };
        assert!(should_apply(&create, &snapshot()));
        let index = PrimitiveOp::CreateIndex(IndexSpec::new("idx", "AssetPart", vec!["id".into()]));
        assert!(should_apply(&index, &snapshot()));
    }

    #[test]
    fn test_rebuild_only_when_columns_differ() {
        assert!(!should_apply(&rebuild_to(columns()), &snapshot()));

        let mut relaxed = columns();
        relaxed[1].nullable = true;
        assert!(should_apply(&rebuild_to(relaxed), &snapshot()));

        let mut reordered = columns();
        reordered.reverse();
        assert!(should_apply(&rebuild_to(reordered), &snapshot()));
    }

    #[test]
    fn test_rebuild_ignores_default_changes() {
        let mut defaulted = columns();
        defaulted[1] = defaulted[1].clone().default_value("system");
        assert!(!should_apply(&rebuild_to(defaulted), &snapshot()));
    }

    #[test]
    fn test_drop_and_rename_are_skipped_once_done() {
        let drop = PrimitiveOp::DropTable {
            table: "AssetPart_old".into(),
            if_exists: false,
        };
        assert!(!should_apply(&drop, &snapshot()));

        let rename = PrimitiveOp::RenameTable {
            from: "AssetPart_new".into(),
            to: "AssetPart".into(),
        };
        assert!(!should_apply(&rename, &snapshot()));
    }
}
