//! Append-only record of migration attempts, stored in the target database.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use log::debug;

use crate::core::{ColumnSpec, DataType, MigrateError, MigrateResult, Row, RowId, Value};
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(MigrateError::Source(format!("unknown migration status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub id: i64,
    pub name: String,
    pub checksum: String,
    pub status: MigrationStatus,
    /// When the record reached a terminal status.
    pub applied_at: Option<NaiveDateTime>,
    pub error: Option<String>,
}

impl MigrationRecord {
    fn to_row(&self) -> Row {
        vec![
            Value::Integer(self.id),
            Value::Text(self.name.clone()),
            Value::Text(self.checksum.clone()),
            Value::Text(self.status.to_string()),
            self.applied_at.map(Value::Timestamp).unwrap_or(Value::Null),
            self.error.clone().map(Value::Text).unwrap_or(Value::Null),
        ]
    }

    fn from_row(row: &Row) -> MigrateResult<Self> {
        let text = |i: usize| -> MigrateResult<String> {
            row.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| MigrateError::Source(format!("malformed ledger row: {:?}", row)))
        };

        Ok(Self {
            id: row
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| MigrateError::Source(format!("malformed ledger row: {:?}", row)))?,
            name: text(1)?,
            checksum: text(2)?,
            status: text(3)?.parse()?,
            applied_at: match row.get(4) {
                Some(Value::Timestamp(ts)) => Some(*ts),
                _ => None,
            },
            error: row.get(5).and_then(Value::as_str).map(str::to_string),
        })
    }
}

fn ledger_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("id", DataType::Integer).primary_key(),
        ColumnSpec::new("name", DataType::Text).not_null(),
        ColumnSpec::new("checksum", DataType::Text).not_null(),
        ColumnSpec::new("status", DataType::Text).not_null(),
        ColumnSpec::new("applied_at", DataType::Timestamp),
        ColumnSpec::new("error", DataType::Text),
    ]
}

/// Reads and appends ledger records. Records are never deleted; the only
/// change a record ever sees is its single move out of `pending`.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure(&self, store: &mut dyn Store) -> MigrateResult<()> {
        if store.create_table(&self.table, ledger_columns(), true).await? {
            debug!("Created migration ledger table {}", self.table);
        }
        Ok(())
    }

    async fn rows(&self, store: &dyn Store) -> MigrateResult<Vec<(RowId, MigrationRecord)>> {
        if !store.snapshot().await?.has_table(&self.table) {
            return Ok(Vec::new());
        }
        let mut rows = store
            .scan(&self.table)
            .await?
            .iter()
            .map(|(row_id, row)| Ok((*row_id, MigrationRecord::from_row(row)?)))
            .collect::<MigrateResult<Vec<_>>>()?;
        rows.sort_by_key(|(_, record)| record.id);
        Ok(rows)
    }

    /// Every record, oldest first. Empty when the ledger does not exist yet.
    pub async fn records(&self, store: &dyn Store) -> MigrateResult<Vec<MigrationRecord>> {
        Ok(self.rows(store).await?.into_iter().map(|(_, record)| record).collect())
    }

    /// The most recent record for `name`.
    pub async fn latest(&self, store: &dyn Store, name: &str) -> MigrateResult<Option<MigrationRecord>> {
        Ok(self
            .records(store)
            .await?
            .into_iter()
            .rev()
            .find(|record| record.name == name))
    }

    /// Appends a `pending` record with the next id.
    pub async fn begin(&self, store: &mut dyn Store, name: &str, checksum: &str) -> MigrateResult<MigrationRecord> {
        let next_id = self
            .records(store)
            .await?
            .last()
            .map(|record| record.id + 1)
            .unwrap_or(1);

        let record = MigrationRecord {
            id: next_id,
            name: name.to_string(),
            checksum: checksum.to_string(),
            status: MigrationStatus::Pending,
            applied_at: None,
            error: None,
        };
        store.insert_row(&self.table, record.to_row()).await?;
        store.flush().await?;
        Ok(record)
    }

    /// Moves a pending record to `status`, exactly once.
    pub async fn finish(
        &self,
        store: &mut dyn Store,
        record: &mut MigrationRecord,
        status: MigrationStatus,
        error: Option<String>,
    ) -> MigrateResult<()> {
        let rows = self.rows(store).await?;
        let (row_id, stored) = rows
            .into_iter()
            .find(|(_, stored)| stored.id == record.id)
            .ok_or_else(|| MigrateError::Source(format!("ledger record {} not found", record.id)))?;

        if stored.status.is_terminal() || !status.is_terminal() {
            return Err(MigrateError::LedgerTransition {
                name: stored.name,
                from: stored.status.to_string(),
                to: status.to_string(),
            });
        }

        let applied_at = Utc::now().naive_utc();
        store
            .update_value(&self.table, row_id, "status", Value::Text(status.to_string()))
            .await?;
        store
            .update_value(&self.table, row_id, "applied_at", Value::Timestamp(applied_at))
            .await?;
        if let Some(message) = &error {
            store
                .update_value(&self.table, row_id, "error", Value::Text(message.clone()))
                .await?;
        }
        store.flush().await?;

        record.status = status;
        record.applied_at = Some(applied_at);
        record.error = error;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    #[tokio::test]
    async fn test_records_are_appended_with_monotonic_ids() {
        let mut store = InMemoryStore::new();
        let ledger = Ledger::new("_schema_migrations");
        ledger.ensure(&mut store).await.unwrap();

        let mut first = ledger.begin(&mut store, "001_init", "aaa").await.unwrap();
        ledger
            .finish(&mut store, &mut first, MigrationStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let second = ledger.begin(&mut store, "001_init", "aaa").await.unwrap();

        assert_eq!((first.id, second.id), (1, 2));
        let records = ledger.records(&store).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, MigrationStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("boom"));
        assert!(records[0].applied_at.is_some());
        assert_eq!(ledger.latest(&store, "001_init").await.unwrap().map(|r| r.id), Some(2));
    }

    #[tokio::test]
    async fn test_terminal_records_cannot_transition_again() {
        let mut store = InMemoryStore::new();
        let ledger = Ledger::new("_schema_migrations");
        ledger.ensure(&mut store).await.unwrap();

        let mut record = ledger.begin(&mut store, "002_add_tables", "bbb").await.unwrap();
        ledger
            .finish(&mut store, &mut record, MigrationStatus::Applied, None)
            .await
            .unwrap();

        let err = ledger
            .finish(&mut store, &mut record, MigrationStatus::Failed, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::LedgerTransition { .. }));
        assert_eq!(ledger.records(&store).await.unwrap()[0].status, MigrationStatus::Applied);
    }

    #[tokio::test]
    async fn test_missing_ledger_reads_empty() {
        let store = InMemoryStore::new();
        let ledger = Ledger::new("_schema_migrations");
        assert!(ledger.records(&store).await.unwrap().is_empty());
        assert!(ledger.latest(&store, "001_init").await.unwrap().is_none());
    }
}
