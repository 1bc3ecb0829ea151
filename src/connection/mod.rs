pub mod config;

use log::info;

use crate::core::MigrateResult;
use crate::storage::{InMemoryStore, SnapshotManager, Store};
use config::{ConnectionConfig, StoreKind};

pub use config::{RunnerConfig, DATABASE_URL_ENV};

/// Opens the store a configuration points at.
///
/// A `memory://` store starts empty every time; a `file://` store loads its
/// snapshot if one exists and creates it on first write otherwise.
pub fn open_store(config: &ConnectionConfig) -> MigrateResult<Box<dyn Store>> {
    config.validate()?;
    info!("Opening store {}", config);

    let store = match &config.store {
        StoreKind::Memory { .. } => InMemoryStore::new(),
        StoreKind::File { path } => InMemoryStore::open(SnapshotManager::new(path))?,
    };
    Ok(Box::new(store))
}
