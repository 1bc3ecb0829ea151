use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;

use super::catalog::{LiveSchemaSnapshot, TableShape};
use super::engine::Store;
use super::persistence::{DatabaseSnapshot, SnapshotManager};
use super::table::Table;
use crate::core::{ColumnSpec, DbError, IndexSpec, Result, Row, RowId, Value};
use crate::parser::{DmlStatement, SqlScriptAdapter};

/// A SQLite-like store held in memory, optionally backed by a snapshot file.
pub struct InMemoryStore {
    /// Keyed by lowercased table name
    tables: BTreeMap<String, Table>,
    persistence: Option<SnapshotManager>,
    /// Row writes not yet saved to the snapshot file
    dirty: bool,
    parser: SqlScriptAdapter,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            persistence: None,
            dirty: false,
            parser: SqlScriptAdapter::new(),
        }
    }

    /// Opens (or creates) a store persisted to `snapshot`.
    ///
    /// Schema changes and SQL statements are saved as they complete. Single
    /// row writes are buffered until [`Store::flush`], so copying or
    /// backfilling a table costs one save instead of one per row.
    pub fn open(snapshot: SnapshotManager) -> Result<Self> {
        let tables = match snapshot.load()? {
            Some(saved) => {
                debug!(
                    "Loaded {} tables ({} rows) from {}",
                    saved.metadata.table_count,
                    saved.metadata.row_count,
                    snapshot.path().display()
                );
                saved.tables
            }
            None => BTreeMap::new(),
        };

        Ok(Self {
            tables,
            persistence: Some(snapshot),
            dirty: false,
            parser: SqlScriptAdapter::new(),
        })
    }

    fn get_table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(&key(name))
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    fn get_table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(&key(name))
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    fn index_exists(&self, name: &str) -> bool {
        self.tables
            .values()
            .flat_map(|t| t.indexes())
            .any(|i| i.name.eq_ignore_ascii_case(name))
    }

    fn persist(&mut self) -> Result<()> {
        if let Some(manager) = &self.persistence {
            manager.save(&DatabaseSnapshot::new(self.tables.clone()))?;
        }
        self.dirty = false;
        Ok(())
    }

    fn matching_rows(&self, table: &Table, filter: Option<&crate::core::Condition>) -> Result<Vec<RowId>> {
        let mut ids = Vec::new();
        for (id, row) in table.scan() {
            let keep = match filter {
                Some(condition) => condition.matches(table.columns(), &row)?,
                None => true,
            };
            if keep {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn execute_dml(&mut self, statement: DmlStatement) -> Result<usize> {
        match statement {
            DmlStatement::Insert { table, columns, rows } => {
                // Build on a copy so a failing row leaves the table as it was.
                let mut target = self.get_table(&table)?.clone();
                let count = rows.len();
                for row in rows {
                    match &columns {
                        Some(names) => target.insert_named(names, row)?,
                        None => target.insert(row)?,
                    };
                }
                self.tables.insert(key(&table), target);
                Ok(count)
            }
            DmlStatement::Update { table, assignments, filter } => {
                let mut target = self.get_table(&table)?.clone();
                let ids = self.matching_rows(&target, filter.as_ref())?;
                for id in &ids {
                    for (column, value) in &assignments {
                        target.update_value(*id, column, value.clone())?;
                    }
                }
                self.tables.insert(key(&table), target);
                Ok(ids.len())
            }
            DmlStatement::Delete { table, filter } => {
                let ids = self.matching_rows(self.get_table(&table)?, filter.as_ref())?;
                let target = self.get_table_mut(&table)?;
                for id in &ids {
                    target.delete(*id);
                }
                Ok(ids.len())
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn snapshot(&self) -> Result<LiveSchemaSnapshot> {
        Ok(LiveSchemaSnapshot::from_tables(self.tables.values().map(|table| TableShape {
            name: table.name().to_string(),
            columns: table.columns().to_vec(),
            indexes: table.indexes().to_vec(),
        })))
    }

    async fn create_table(&mut self, name: &str, columns: Vec<ColumnSpec>, if_not_exists: bool) -> Result<bool> {
        if self.tables.contains_key(&key(name)) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(DbError::TableExists(name.to_string()));
        }
        if columns.is_empty() {
            return Err(DbError::ExecutionError(format!("Table '{}' must have at least one column", name)));
        }

        let table = Table::new(name, columns)?;
        self.tables.insert(key(name), table);
        self.persist()?;
        Ok(true)
    }

    async fn add_column(&mut self, table: &str, column: ColumnSpec) -> Result<()> {
        self.get_table_mut(table)?.add_column(column)?;
        self.persist()
    }

    async fn create_index(&mut self, index: IndexSpec, if_not_exists: bool) -> Result<bool> {
        if self.index_exists(&index.name) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(DbError::IndexExists(index.name));
        }

        let table = index.table.clone();
        self.get_table_mut(&table)?.add_index(index)?;
        self.persist()?;
        Ok(true)
    }

    async fn drop_table(&mut self, name: &str) -> Result<()> {
        if self.tables.remove(&key(name)).is_none() {
            return Err(DbError::TableNotFound(name.to_string()));
        }
        self.persist()
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> Result<()> {
        if self.tables.contains_key(&key(to)) {
            return Err(DbError::TableExists(to.to_string()));
        }
        let mut table = self
            .tables
            .remove(&key(from))
            .ok_or_else(|| DbError::TableNotFound(from.to_string()))?;
        table.rename(to);
        self.tables.insert(key(to), table);
        self.persist()
    }

    async fn scan(&self, table: &str) -> Result<Vec<(RowId, Row)>> {
        Ok(self.get_table(table)?.scan())
    }

    async fn insert_row(&mut self, table: &str, row: Row) -> Result<RowId> {
        let id = self.get_table_mut(table)?.insert(row)?;
        self.dirty = true;
        Ok(id)
    }

    async fn update_value(&mut self, table: &str, id: RowId, column: &str, value: Value) -> Result<()> {
        self.get_table_mut(table)?.update_value(id, column, value)?;
        self.dirty = true;
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.get_table(table)?.row_count())
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<usize> {
        let statement = self.parser.parse_dml(sql)?;
        let affected = self.execute_dml(statement)?;
        self.persist()?;
        Ok(affected)
    }

    async fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use tempfile::TempDir;

    fn asset_columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", DataType::Text).primary_key(),
            ColumnSpec::new("status", DataType::Text).not_null(),
            ColumnSpec::new("powerState", DataType::Text),
        ]
    }

    #[tokio::test]
    async fn test_create_table_if_not_exists() {
        let mut store = InMemoryStore::new();
        assert!(store.create_table("Asset", asset_columns(), false).await.unwrap());
        assert!(!store.create_table("asset", asset_columns(), true).await.unwrap());
        let err = store.create_table("ASSET", asset_columns(), false).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_index_names_are_global() {
        let mut store = InMemoryStore::new();
        store.create_table("Asset", asset_columns(), false).await.unwrap();
        store.create_table("Part", vec![ColumnSpec::new("id", DataType::Text)], false).await.unwrap();

        let index = IndexSpec::new("idx_id", "Asset", vec!["id".into()]);
        assert!(store.create_index(index, false).await.unwrap());
        let clash = IndexSpec::new("idx_id", "Part", vec!["id".into()]);
        assert!(!store.create_index(clash.clone(), true).await.unwrap());
        assert!(store.create_index(clash, false).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_execute_dml() {
        let mut store = InMemoryStore::new();
        store.create_table("Asset", asset_columns(), false).await.unwrap();

        let inserted = store
            .execute_sql("INSERT INTO Asset (id, status) VALUES ('a1', 'operational'), ('a2', 'down'), ('a3', 'down')")
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        let updated = store
            .execute_sql("UPDATE Asset SET powerState = 'off' WHERE status = 'down'")
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let deleted = store.execute_sql("DELETE FROM Asset WHERE powerState IS NULL").await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.row_count("Asset").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_insert_is_all_or_nothing() {
        let mut store = InMemoryStore::new();
        store.create_table("Asset", asset_columns(), false).await.unwrap();

        let err = store
            .execute_sql("INSERT INTO Asset (id, status) VALUES ('a1', 'operational'), ('a1', 'down')")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));
        assert_eq!(store.row_count("Asset").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rename_keeps_rows_and_indexes() {
        let mut store = InMemoryStore::new();
        store.create_table("AssetPart_new", asset_columns(), false).await.unwrap();
        store.insert_row("AssetPart_new", vec!["p1".into(), "ok".into(), Value::Null]).await.unwrap();
        store
            .create_index(IndexSpec::new("idx_status", "AssetPart_new", vec!["status".into()]), false)
            .await
            .unwrap();

        store.rename_table("AssetPart_new", "AssetPart").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert!(!snapshot.has_table("AssetPart_new"));
        assert_eq!(snapshot.index("idx_status").map(|i| i.table.as_str()), Some("AssetPart"));
        assert_eq!(store.row_count("AssetPart").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cmms.db");

        {
            let mut store = InMemoryStore::open(SnapshotManager::new(&path)).unwrap();
            store.create_table("Asset", asset_columns(), false).await.unwrap();
            store.insert_row("Asset", vec!["a1".into(), "down".into(), Value::Null]).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = InMemoryStore::open(SnapshotManager::new(&path)).unwrap();
        assert_eq!(store.row_count("asset").await.unwrap(), 1);
        assert!(store.snapshot().await.unwrap().has_column("Asset", "powerState"));
    }

    #[tokio::test]
    async fn test_row_writes_are_saved_on_flush() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cmms.db");

        let mut store = InMemoryStore::open(SnapshotManager::new(&path)).unwrap();
        store.create_table("Asset", asset_columns(), false).await.unwrap();
        for i in 0..3 {
            store
                .insert_row("Asset", vec![format!("a{}", i).into(), "down".into(), Value::Null])
                .await
                .unwrap();
        }
        let on_disk = InMemoryStore::open(SnapshotManager::new(&path)).unwrap();
        assert_eq!(on_disk.row_count("Asset").await.unwrap(), 0);

        store.flush().await.unwrap();
        let on_disk = InMemoryStore::open(SnapshotManager::new(&path)).unwrap();
        assert_eq!(on_disk.row_count("Asset").await.unwrap(), 3);
    }
}
