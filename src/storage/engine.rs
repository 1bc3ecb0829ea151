use async_trait::async_trait;

use super::catalog::LiveSchemaSnapshot;
use crate::core::{ColumnSpec, IndexSpec, Result, Row, RowId, Value};

/// The single logical connection the migration engine drives.
///
/// Stores behave like SQLite: columns can be added in place but never altered
/// or dropped, index names are global, and dropping a table drops its indexes.
/// Callers await every operation before issuing the next one.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fresh structural view of every table, column and index.
    async fn snapshot(&self) -> Result<LiveSchemaSnapshot>;

    /// Returns `false` when `if_not_exists` is set and the table was already there.
    async fn create_table(&mut self, name: &str, columns: Vec<ColumnSpec>, if_not_exists: bool) -> Result<bool>;

    async fn add_column(&mut self, table: &str, column: ColumnSpec) -> Result<()>;

    /// Returns `false` when `if_not_exists` is set and the index was already there.
    async fn create_index(&mut self, index: IndexSpec, if_not_exists: bool) -> Result<bool>;

    async fn drop_table(&mut self, name: &str) -> Result<()>;

    async fn rename_table(&mut self, from: &str, to: &str) -> Result<()>;

    async fn scan(&self, table: &str) -> Result<Vec<(RowId, Row)>>;

    /// Inserts a row given in the table's column order.
    async fn insert_row(&mut self, table: &str, row: Row) -> Result<RowId>;

    async fn update_value(&mut self, table: &str, id: RowId, column: &str, value: Value) -> Result<()>;

    async fn row_count(&self, table: &str) -> Result<usize>;

    /// Runs a raw statement and returns the number of affected rows.
    async fn execute_sql(&mut self, sql: &str) -> Result<usize>;

    /// Makes every completed operation durable. Stores may hold single row
    /// writes back until this is called.
    async fn flush(&mut self) -> Result<()>;
}
