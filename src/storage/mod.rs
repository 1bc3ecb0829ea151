pub mod catalog;
pub mod engine;
pub mod memory;
pub mod persistence;
pub mod table;

pub use catalog::{LiveSchemaSnapshot, TableShape};
pub use engine::Store;
pub use memory::InMemoryStore;
pub use persistence::SnapshotManager;
pub use table::Table;
