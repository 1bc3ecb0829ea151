//! File snapshots for stores opened with a `file://` URL

use crate::core::{DbError, Result};
use crate::storage::table::Table;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Database Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: u32,
    pub tables: BTreeMap<String, Table>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: NaiveDateTime,
    pub row_count: usize,
    pub table_count: usize,
}

impl DatabaseSnapshot {
    pub fn new(tables: BTreeMap<String, Table>) -> Self {
        let row_count = tables.values().map(|t| t.row_count()).sum();
        let table_count = tables.len();
        Self {
            version: SNAPSHOT_VERSION,
            tables,
            metadata: SnapshotMetadata {
                created_at: Utc::now().naive_utc(),
                row_count,
                table_count,
            },
        }
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Writes to a sibling temp file, syncs it, then renames it over the snapshot.
    pub fn save(&self, snapshot: &DatabaseSnapshot) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| DbError::IoError(format!("Failed to create snapshot directory: {}", e)))?;
        }
        let temp_path = self.snapshot_path.with_extension("tmp");
        let temp_file = File::create(&temp_path)
            .map_err(|e| DbError::IoError(format!("Failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(temp_file);
        // Named encoding: column specs skip empty fields, which positional encoding cannot express.
        let serialized = rmp_serde::to_vec_named(snapshot)
            .map_err(|e| DbError::ExecutionError(format!("Failed to serialize snapshot: {}", e)))?;
        writer
            .write_all(&serialized)
            .map_err(|e| DbError::IoError(format!("Failed to write snapshot: {}", e)))?;
        writer
            .flush()
            .map_err(|e| DbError::IoError(format!("Failed to flush snapshot: {}", e)))?;
        writer
            .get_mut()
            .sync_all()
            .map_err(|e| DbError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        fs::rename(&temp_path, &self.snapshot_path)
            .map_err(|e| DbError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<DatabaseSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| DbError::IoError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| DbError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: DatabaseSnapshot = rmp_serde::from_slice(&data)
            .map_err(|e| DbError::ExecutionError(format!("Failed to deserialize snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DbError::ExecutionError(format!(
                "Unsupported snapshot version {} in {}",
                snapshot.version,
                self.snapshot_path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}
