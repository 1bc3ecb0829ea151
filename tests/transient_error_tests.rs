//! Connection and I/O failures from the store, injected through a wrapper.

use async_trait::async_trait;

use cmms_migrate::core::{ColumnSpec, DataType, DbError, IndexSpec, MigrateError, Result, Row, RowId, Value};
use cmms_migrate::migrate::{
    Backfill, Migration, MigrationOutcome, MigrationRunner, MigrationStatus, RebuildCoordinator, RebuildSpec,
    RebuildState, RowRule, SchemaDelta,
};
use cmms_migrate::{InMemoryStore, LiveSchemaSnapshot, RunnerConfig, Store};

#[derive(Debug, Clone, Copy)]
enum Fault {
    InsertInto(&'static str),
    UpdateIn(&'static str),
    RowCount(&'static str),
    DropTable(&'static str),
}

/// An in-memory store that loses its connection on one kind of call.
struct FlakyStore {
    inner: InMemoryStore,
    fault: Fault,
}

impl FlakyStore {
    fn new(inner: InMemoryStore, fault: Fault) -> Self {
        Self { inner, fault }
    }
}

fn connection_lost() -> DbError {
    DbError::ConnectionError("connection reset by peer".into())
}

#[async_trait]
impl Store for FlakyStore {
    async fn snapshot(&self) -> Result<LiveSchemaSnapshot> {
        self.inner.snapshot().await
    }

    async fn create_table(&mut self, name: &str, columns: Vec<ColumnSpec>, if_not_exists: bool) -> Result<bool> {
        self.inner.create_table(name, columns, if_not_exists).await
    }

    async fn add_column(&mut self, table: &str, column: ColumnSpec) -> Result<()> {
        self.inner.add_column(table, column).await
    }

    async fn create_index(&mut self, index: IndexSpec, if_not_exists: bool) -> Result<bool> {
        self.inner.create_index(index, if_not_exists).await
    }

    async fn drop_table(&mut self, name: &str) -> Result<()> {
        match self.fault {
            Fault::DropTable(table) if table == name => Err(DbError::IoError("disk I/O error".into())),
            _ => self.inner.drop_table(name).await,
        }
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> Result<()> {
        self.inner.rename_table(from, to).await
    }

    async fn scan(&self, table: &str) -> Result<Vec<(RowId, Row)>> {
        self.inner.scan(table).await
    }

    async fn insert_row(&mut self, table: &str, row: Row) -> Result<RowId> {
        match self.fault {
            Fault::InsertInto(target) if target == table => Err(connection_lost()),
            _ => self.inner.insert_row(table, row).await,
        }
    }

    async fn update_value(&mut self, table: &str, id: RowId, column: &str, value: Value) -> Result<()> {
        match self.fault {
            Fault::UpdateIn(target) if target == table => Err(connection_lost()),
            _ => self.inner.update_value(table, id, column, value).await,
        }
    }

    async fn row_count(&self, table: &str) -> Result<usize> {
        match self.fault {
            Fault::RowCount(target) if target == table => Err(connection_lost()),
            _ => self.inner.row_count(table).await,
        }
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<usize> {
        self.inner.execute_sql(sql).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }
}

async fn parts(fault: Fault) -> FlakyStore {
    let mut store = InMemoryStore::new();
    store
        .create_table(
            "Part",
            vec![
                ColumnSpec::new("id", DataType::Text).primary_key(),
                ColumnSpec::new("quantity", DataType::Text),
            ],
            false,
        )
        .await
        .unwrap();
    for (id, quantity) in [("p1", "4"), ("p2", "10"), ("p3", "7")] {
        store.insert_row("Part", vec![id.into(), quantity.into()]).await.unwrap();
    }
    FlakyStore::new(store, fault)
}

fn integer_quantity() -> RebuildSpec {
    RebuildSpec {
        table: "Part".into(),
        columns: vec![
            ColumnSpec::new("id", DataType::Text).primary_key(),
            ColumnSpec::new("quantity", DataType::Integer),
        ],
        converters: Default::default(),
    }
}

#[tokio::test]
async fn test_transient_error_fails_only_that_migration() -> anyhow::Result<()> {
    let store = parts(Fault::InsertInto("Part__shadow")).await;
    let mut runner = MigrationRunner::new(Box::new(store), RunnerConfig::default())?;

    let batch = vec![
        Migration::new("001_part_notes").with_delta(SchemaDelta::add_column("Part", ColumnSpec::new("notes", DataType::Text))),
        Migration::new("002_numeric_quantity").with_delta(SchemaDelta::widen_column(
            "Part",
            ColumnSpec::new("quantity", DataType::Integer),
        )),
        Migration::new("003_vendors").with_sql("CREATE TABLE Vendor (id TEXT PRIMARY KEY);")?,
    ];
    let report = runner.run(&batch).await?;

    let statuses: Vec<MigrationOutcome> = report.migrations.iter().map(|m| m.status).collect();
    assert_eq!(
        statuses,
        vec![MigrationOutcome::Applied, MigrationOutcome::Failed, MigrationOutcome::Applied]
    );
    assert_eq!(report.exit_code(), 1);
    let expected = MigrateError::TransientConnectionError(connection_lost()).to_string();
    assert_eq!(report.migrations[1].error.as_deref(), Some(expected.as_str()));

    let ledger = runner.status().await?;
    assert_eq!(ledger[1].status, MigrationStatus::Failed);

    let snapshot = runner.store().snapshot().await?;
    assert!(snapshot.has_table("Vendor"));
    let quantity = snapshot.table("Part").and_then(|t| t.column("quantity")).map(|c| c.data_type);
    assert_eq!(quantity, Some(DataType::Text));
    assert_eq!(runner.store().row_count("Part").await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_backfill_stops_on_transient_error() -> anyhow::Result<()> {
    let mut store = parts(Fault::UpdateIn("Part")).await;
    let backfill = Backfill::new("Part", "quantity", RowRule::CopyColumn("id".into()));

    let err = backfill.execute(&mut store).await.unwrap_err();
    assert!(err.is_transient());
    let quantities: Vec<Value> = store.scan("Part").await?.into_iter().map(|(_, row)| row[1].clone()).collect();
    assert_eq!(quantities, vec![Value::from("4"), Value::from("10"), Value::from("7")]);
    Ok(())
}

#[tokio::test]
async fn test_rebuild_copy_aborts_on_transient_error() -> anyhow::Result<()> {
    let mut store = parts(Fault::InsertInto("Part__shadow")).await;
    let mut coordinator = RebuildCoordinator::new(&mut store, "__shadow");

    let err = coordinator.rebuild(&integer_quantity()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(coordinator.state(), RebuildState::Failed);
    assert_eq!(store.row_count("Part").await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_rebuild_verification_error_leaves_failed_state() -> anyhow::Result<()> {
    let mut store = parts(Fault::RowCount("Part__shadow")).await;
    let mut coordinator = RebuildCoordinator::new(&mut store, "__shadow");

    let err = coordinator.rebuild(&integer_quantity()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(coordinator.state(), RebuildState::Failed);

    let snapshot = store.snapshot().await?;
    assert!(snapshot.has_table("Part"));
    assert!(snapshot.has_table("Part__shadow"));
    Ok(())
}

#[tokio::test]
async fn test_rebuild_swap_error_leaves_failed_state() -> anyhow::Result<()> {
    let mut store = parts(Fault::DropTable("Part")).await;
    let mut coordinator = RebuildCoordinator::new(&mut store, "__shadow");

    let err = coordinator.rebuild(&integer_quantity()).await.unwrap_err();
    assert!(matches!(err, MigrateError::TransientConnectionError(DbError::IoError(_))));
    assert_eq!(coordinator.state(), RebuildState::Failed);
    assert_eq!(store.row_count("Part").await?, 3);
    assert_eq!(store.row_count("Part__shadow").await?, 3);
    Ok(())
}
