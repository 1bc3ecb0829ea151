//! Migrations as authored: SQL scripts, JSON step lists, or built in code.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use regex::Regex;
use sha2::{Digest, Sha256};

use super::backfill::Backfill;
use super::delta::SchemaDelta;
use super::planner::PrimitiveOp;
use crate::core::{MigrateError, MigrateResult};
use crate::parser::{split_statements, ScriptStatement, SqlScriptAdapter};

const FILE_PATTERN: &str = r"^(\d+)_([A-Za-z0-9_\-]+)\.(sql|json)$";

#[derive(Debug, Clone)]
pub enum MigrationStep {
    /// Planned against a fresh snapshot when the step is reached.
    Delta(SchemaDelta),
    /// Issued as is, after the idempotency check.
    Primitive(PrimitiveOp),
    Backfill(Backfill),
}

impl MigrationStep {
    pub fn describe(&self) -> String {
        match self {
            Self::Delta(delta) => delta.describe(),
            Self::Primitive(op) => op.to_string(),
            Self::Backfill(backfill) => backfill.describe(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Delta(delta) => &delta.target_table,
            Self::Primitive(op) => op.table(),
            Self::Backfill(backfill) => &backfill.table,
        }
    }
}

/// A named, ordered list of steps. The name is the identity the ledger uses.
#[derive(Debug, Clone)]
pub struct Migration {
    pub name: String,
    pub steps: Vec<MigrationStep>,
    script_text: String,
    /// Set when the file could not be read or parsed; the migration has no
    /// steps and fails when its turn comes.
    load_error: Option<MigrateError>,
}

impl Migration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            script_text: String::new(),
            load_error: None,
        }
    }

    fn unloadable(name: String, script_text: String, error: MigrateError) -> Self {
        Self {
            name,
            steps: Vec::new(),
            script_text,
            load_error: Some(error),
        }
    }

    /// Appends the statements of a SQL script. Comments are stripped and the
    /// script is split on `;` before each statement is classified.
    pub fn with_sql(mut self, script: &str) -> MigrateResult<Self> {
        self.steps.extend(steps_from_sql(script)?);
        self.script_text.push_str(script);
        self.script_text.push('\n');
        Ok(self)
    }

    pub fn with_delta(self, delta: SchemaDelta) -> Self {
        self.with_step(MigrationStep::Delta(delta))
    }

    pub fn with_primitive(self, op: PrimitiveOp) -> Self {
        self.with_step(MigrationStep::Primitive(op))
    }

    pub fn with_backfill(self, backfill: Backfill) -> Self {
        self.with_step(MigrationStep::Backfill(backfill))
    }

    fn with_step(mut self, step: MigrationStep) -> Self {
        let _ = writeln!(self.script_text, "{}", step.describe());
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn load_error(&self) -> Option<&MigrateError> {
        self.load_error.as_ref()
    }

    /// Lowercase hex SHA-256 of the migration text.
    pub fn checksum(&self) -> String {
        format!("{:x}", Sha256::digest(self.script_text.as_bytes()))
    }

    /// Reads `{"steps": [...]}` where each step is a delta (has `operation`),
    /// `{"sql": "..."}` or `{"backfill": {...}}`.
    pub fn from_json(name: impl Into<String>, text: &str) -> MigrateResult<Self> {
        let name = name.into();
        let raw: serde_json::Value =
            serde_json::from_str(text).map_err(|e| MigrateError::Source(format!("{}: invalid JSON: {}", name, e)))?;
        let entries = raw
            .get("steps")
            .and_then(|v| v.as_array())
            .ok_or_else(|| MigrateError::Source(format!("{}: expected a 'steps' array", name)))?;

        let mut steps = Vec::new();
        for entry in entries {
            if entry.get("operation").is_some() {
                steps.push(MigrationStep::Delta(SchemaDelta::from_json(entry.clone())?));
            } else if let Some(sql) = entry.get("sql").and_then(|v| v.as_str()) {
                steps.extend(steps_from_sql(sql)?);
            } else if let Some(backfill) = entry.get("backfill") {
                steps.push(MigrationStep::Backfill(Backfill::from_json(backfill.clone())?));
            } else {
                return Err(MigrateError::Source(format!("{}: unrecognised step {}", name, entry)));
            }
        }

        Ok(Self {
            name,
            steps,
            script_text: text.to_string(),
            load_error: None,
        })
    }

    /// Loads one migration file; the file stem becomes the migration name.
    pub fn load_file(path: &Path) -> MigrateResult<Self> {
        let mut migration = Self::read_file(path);
        match migration.load_error.take() {
            Some(err) => Err(err),
            None => Ok(migration),
        }
    }

    /// Like [`Migration::load_file`], but a file that cannot be read or
    /// parsed still yields a migration, carrying the error.
    fn read_file(path: &Path) -> Self {
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        let failed = |text: String, error: MigrateError| {
            let error = MigrateError::Load {
                file: file_name.clone(),
                error: Box::new(error),
            };
            warn!("{}", error);
            Self::unloadable(name.clone(), text, error)
        };

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => return failed(String::new(), MigrateError::Source(e.to_string())),
        };

        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(name.clone(), &text),
            _ => steps_from_sql(&text).map(|steps| Self {
                name: name.clone(),
                steps,
                script_text: text.clone(),
                load_error: None,
            }),
        };
        match parsed {
            Ok(migration) => {
                debug!("Loaded migration {} with {} steps", migration.name, migration.len());
                migration
            }
            Err(error) => failed(text, error),
        }
    }
}

/// Turns a SQL script into steps. Structural statements become deltas or
/// checked primitives; everything else is executed verbatim.
pub fn steps_from_sql(script: &str) -> MigrateResult<Vec<MigrationStep>> {
    let adapter = SqlScriptAdapter::new();
    let mut steps = Vec::new();

    for (index, statement) in split_statements(script).iter().enumerate() {
        let classified = adapter.classify(statement).map_err(|e| MigrateError::Script {
            index: index + 1,
            message: e.to_string(),
        })?;

        for stmt in classified {
            steps.push(match stmt {
                ScriptStatement::CreateTable { table, columns, .. } => {
                    MigrationStep::Delta(SchemaDelta::add_table(table, columns))
                }
                ScriptStatement::AddColumn { table, column } => {
                    MigrationStep::Delta(SchemaDelta::add_column(table, column))
                }
                ScriptStatement::DropColumn { table, column } => {
                    MigrationStep::Delta(SchemaDelta::drop_column(table, column))
                }
                ScriptStatement::CreateIndex { index, .. } => {
                    let columns: Vec<&str> = index.columns.iter().map(String::as_str).collect();
                    let delta = if index.unique {
                        SchemaDelta::add_unique_index(&index.table, &index.name, &columns)
                    } else {
                        SchemaDelta::add_index(&index.table, &index.name, &columns)
                    };
                    MigrationStep::Delta(delta)
                }
                ScriptStatement::DropTable { table, if_exists } => {
                    MigrationStep::Primitive(PrimitiveOp::DropTable { table, if_exists })
                }
                ScriptStatement::RenameTable { from, to } => {
                    MigrationStep::Primitive(PrimitiveOp::RenameTable { from, to })
                }
                ScriptStatement::Other(sql) => MigrationStep::Primitive(PrimitiveOp::Execute { sql }),
            });
        }
    }

    Ok(steps)
}

/// Loads every `<number>_<name>.sql|json` file of `dir`, ordered by number
/// and then by name. Other entries are ignored.
///
/// Only an unreadable directory is an error. A file that cannot be read or
/// parsed is returned as a migration whose [`Migration::load_error`] is set,
/// so the runner fails that migration alone.
pub fn load_directory(dir: &Path) -> MigrateResult<Vec<Migration>> {
    let pattern = Regex::new(FILE_PATTERN).map_err(|e| MigrateError::Source(e.to_string()))?;
    let entries =
        fs::read_dir(dir).map_err(|e| MigrateError::Source(format!("cannot read {}: {}", dir.display(), e)))?;

    let mut files: Vec<(u64, String, PathBuf)> = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| MigrateError::Source(format!("cannot read {}: {}", dir.display(), e)))?
            .path();
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();

        let Some(caps) = pattern.captures(&file_name).filter(|_| path.is_file()) else {
            debug!("Ignoring {} in migration directory", path.display());
            continue;
        };
        let number = caps[1]
            .parse::<u64>()
            .map_err(|e| MigrateError::Source(format!("{}: {}", file_name, e)))?;
        files.push((number, file_name, path));
    }
    files.sort();

    Ok(files.iter().map(|(_, _, path)| Migration::read_file(path)).collect())
}
