use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{ColumnSpec, IndexSpec};

/// Structure of one live table: its columns in declaration order and its indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub indexes: Vec<IndexSpec>,
}

impl TableShape {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            columns,
            indexes: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// True when both shapes list the same columns, in the same order, with the
    /// same type and nullability.
    pub fn same_columns(&self, desired: &[ColumnSpec]) -> bool {
        self.columns.len() == desired.len()
            && self.columns.iter().zip(desired).all(|(live, want)| live.same_shape(want))
    }
}

/// Point-in-time, read-only view of the store's tables, columns and indexes.
///
/// Cloning is cheap; the `with_*` / `without_*` methods return a new snapshot
/// and leave the original untouched, which is how dry runs simulate changes.
#[derive(Debug, Clone, Default)]
pub struct LiveSchemaSnapshot {
    tables: Arc<BTreeMap<String, TableShape>>,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl LiveSchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: impl IntoIterator<Item = TableShape>) -> Self {
        let tables = tables.into_iter().map(|t| (key(&t.name), t)).collect();
        Self { tables: Arc::new(tables) }
    }

    pub fn table(&self, name: &str) -> Option<&TableShape> {
        self.tables.get(&key(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(&key(name))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table).is_some_and(|t| t.has_column(column))
    }

    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.tables
            .values()
            .flat_map(|t| t.indexes.iter())
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.index(name).is_some()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableShape> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.values().map(|t| t.name.as_str()).collect()
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, TableShape>)) -> Self {
        let mut tables = (*self.tables).clone();
        f(&mut tables);
        Self { tables: Arc::new(tables) }
    }

    pub fn with_table(&self, shape: TableShape) -> Self {
        self.modify(|tables| {
            tables.entry(key(&shape.name)).or_insert(shape);
        })
    }

    pub fn without_table(&self, name: &str) -> Self {
        self.modify(|tables| {
            tables.remove(&key(name));
        })
    }

    pub fn with_column(&self, table: &str, column: ColumnSpec) -> Self {
        self.modify(|tables| {
            if let Some(shape) = tables.get_mut(&key(table)) {
                if !shape.has_column(&column.name) {
                    shape.columns.push(column);
                }
            }
        })
    }

    pub fn with_columns(&self, table: &str, columns: Vec<ColumnSpec>) -> Self {
        self.modify(|tables| {
            if let Some(shape) = tables.get_mut(&key(table)) {
                let surviving: Vec<IndexSpec> = shape
                    .indexes
                    .drain(..)
                    .filter(|i| i.columns.iter().all(|c| columns.iter().any(|col| col.name.eq_ignore_ascii_case(c))))
                    .collect();
                shape.columns = columns;
                shape.indexes = surviving;
            }
        })
    }

    pub fn with_index(&self, index: IndexSpec) -> Self {
        if self.has_index(&index.name) {
            return self.clone();
        }
        self.modify(|tables| {
            if let Some(shape) = tables.get_mut(&key(&index.table)) {
                shape.indexes.push(index);
            }
        })
    }

    pub fn renamed(&self, from: &str, to: &str) -> Self {
        self.modify(|tables| {
            if let Some(mut shape) = tables.remove(&key(from)) {
                shape.name = to.to_string();
                for index in &mut shape.indexes {
                    index.table = to.to_string();
                }
                tables.insert(key(to), shape);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    fn asset_snapshot() -> LiveSchemaSnapshot {
        LiveSchemaSnapshot::from_tables([TableShape::new(
            "Asset",
            vec![
                ColumnSpec::new("id", DataType::Text).primary_key(),
                ColumnSpec::new("status", DataType::Text),
            ],
        )])
    }

    #[test]
    fn test_lookups_ignore_case() {
        let snapshot = asset_snapshot();
        assert!(snapshot.has_table("asset"));
        assert!(snapshot.has_column("ASSET", "Status"));
        assert!(!snapshot.has_column("Asset", "powerState"));
    }

    #[test]
    fn test_simulation_leaves_original_untouched() {
        let snapshot = asset_snapshot();
        let next = snapshot
            .with_column("Asset", ColumnSpec::new("powerState", DataType::Text))
            .with_index(IndexSpec::new("idx_asset_status", "Asset", vec!["status".into()]));

        assert!(next.has_column("Asset", "powerState"));
        assert!(next.has_index("idx_asset_status"));
        assert!(!snapshot.has_column("Asset", "powerState"));
        assert!(!snapshot.has_index("idx_asset_status"));
    }

    #[test]
    fn test_renamed_moves_indexes() {
        let snapshot = asset_snapshot()
            .with_index(IndexSpec::new("idx_asset_status", "Asset", vec!["status".into()]))
            .renamed("Asset", "Asset_old");

        assert!(!snapshot.has_table("Asset"));
        assert_eq!(snapshot.index("idx_asset_status").map(|i| i.table.as_str()), Some("Asset_old"));
    }
}
