use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::core::{ColumnSpec, MigrateError, MigrateResult, Value};

/// Replaces the default coercion for one column while a table is rebuilt.
pub type ColumnConverter = Arc<dyn Fn(&Value) -> MigrateResult<Value> + Send + Sync>;

/// Per-column converters, keyed by lowercased column name.
#[derive(Clone, Default)]
pub struct Converters(BTreeMap<String, ColumnConverter>);

impl Converters {
    pub fn insert(&mut self, column: &str, converter: ColumnConverter) {
        self.0.insert(column.to_ascii_lowercase(), converter);
    }

    pub fn get(&self, column: &str) -> Option<&ColumnConverter> {
        self.0.get(&column.to_ascii_lowercase())
    }
}

impl fmt::Debug for Converters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl PartialEq for Converters {
    fn eq(&self, other: &Self) -> bool {
        self.0.keys().eq(other.0.keys())
    }
}

const KNOWN_OPERATIONS: &[&str] = &[
    "add_column",
    "add_table",
    "add_index",
    "widen_column",
    "drop_column",
    "reshape_table",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DeltaOperation {
    AddColumn {
        column: ColumnSpec,
    },
    AddTable {
        columns: Vec<ColumnSpec>,
    },
    AddIndex {
        name: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
    /// New type or nullability for an existing column.
    WidenColumn {
        column: ColumnSpec,
    },
    DropColumn {
        column: String,
    },
    /// Complete desired column list, in order.
    ReshapeTable {
        columns: Vec<ColumnSpec>,
    },
    /// An operation tag this engine does not know; planning rejects it.
    #[serde(skip)]
    Unsupported {
        tag: String,
    },
}

impl DeltaOperation {
    pub fn tag(&self) -> &str {
        match self {
            Self::AddColumn { .. } => "add_column",
            Self::AddTable { .. } => "add_table",
            Self::AddIndex { .. } => "add_index",
            Self::WidenColumn { .. } => "widen_column",
            Self::DropColumn { .. } => "drop_column",
            Self::ReshapeTable { .. } => "reshape_table",
            Self::Unsupported { tag } => tag,
        }
    }
}

/// One desired structural change to a table. Built by migration authors and
/// consumed once by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDelta {
    pub target_table: String,
    pub operation: DeltaOperation,
    pub converters: Converters,
}

impl SchemaDelta {
    pub fn new(target_table: impl Into<String>, operation: DeltaOperation) -> Self {
        Self {
            target_table: target_table.into(),
            operation,
            converters: Converters::default(),
        }
    }

    pub fn add_column(table: impl Into<String>, column: ColumnSpec) -> Self {
        Self::new(table, DeltaOperation::AddColumn { column })
    }

    pub fn add_table(table: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self::new(table, DeltaOperation::AddTable { columns })
    }

    pub fn add_index(table: impl Into<String>, name: impl Into<String>, columns: &[&str]) -> Self {
        Self::new(
            table,
            DeltaOperation::AddIndex {
                name: name.into(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                unique: false,
            },
        )
    }

    pub fn add_unique_index(table: impl Into<String>, name: impl Into<String>, columns: &[&str]) -> Self {
        let mut delta = Self::add_index(table, name, columns);
        if let DeltaOperation::AddIndex { unique, .. } = &mut delta.operation {
            *unique = true;
        }
        delta
    }

    pub fn widen_column(table: impl Into<String>, column: ColumnSpec) -> Self {
        Self::new(table, DeltaOperation::WidenColumn { column })
    }

    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(table, DeltaOperation::DropColumn { column: column.into() })
    }

    pub fn reshape_table(table: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self::new(table, DeltaOperation::ReshapeTable { columns })
    }

    pub fn unsupported(table: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::new(table, DeltaOperation::Unsupported { tag: tag.into() })
    }

    /// Converts `column` with `converter` instead of the default coercion when
    /// this delta rebuilds the table.
    pub fn with_converter<F>(mut self, column: &str, converter: F) -> Self
    where
        F: Fn(&Value) -> MigrateResult<Value> + Send + Sync + 'static,
    {
        self.converters.insert(column, Arc::new(converter));
        self
    }

    pub fn tag(&self) -> &str {
        self.operation.tag()
    }

    /// Reads a delta from its JSON form, e.g.
    /// `{"operation": "add_column", "table": "Asset", "column": {...}}`.
    ///
    /// Unknown operation tags are kept as [`DeltaOperation::Unsupported`].
    pub fn from_json(raw: serde_json::Value) -> MigrateResult<Self> {
        let tag = raw
            .get("operation")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MigrateError::Source(format!("delta without an 'operation' tag: {}", raw)))?
            .to_string();
        let table = raw
            .get("table")
            .or_else(|| raw.get("target_table"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| MigrateError::InvalidDelta {
                tag: tag.clone(),
                reason: "missing 'table'".to_string(),
            })?
            .to_string();

        if !KNOWN_OPERATIONS.contains(&tag.as_str()) {
            return Ok(Self::unsupported(table, tag));
        }

        let operation: DeltaOperation = serde_json::from_value(raw).map_err(|e| MigrateError::InvalidDelta {
            tag: tag.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(table, operation))
    }

    /// Stable one-line description, used in audit lines and checksums.
    pub fn describe(&self) -> String {
        let t = &self.target_table;
        match &self.operation {
            DeltaOperation::AddColumn { column } => format!("add_column({}.{})", t, column),
            DeltaOperation::AddTable { columns } => format!("add_table({}: {})", t, join_columns(columns)),
            DeltaOperation::AddIndex { name, columns, unique } => format!(
                "add_index({}{} ON {}({}))",
                if *unique { "UNIQUE " } else { "" },
                name,
                t,
                columns.join(", ")
            ),
            DeltaOperation::WidenColumn { column } => format!("widen_column({}.{})", t, column),
            DeltaOperation::DropColumn { column } => format!("drop_column({}.{})", t, column),
            DeltaOperation::ReshapeTable { columns } => format!("reshape_table({}: {})", t, join_columns(columns)),
            DeltaOperation::Unsupported { tag } => format!("{}({})", tag, t),
        }
    }
}

fn join_columns(columns: &[ColumnSpec]) -> String {
    columns.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use serde_json::json;

    #[test]
    fn test_delta_from_json() {
        let delta = SchemaDelta::from_json(json!({
            "operation": "add_column",
            "table": "Asset",
            "column": {"name": "powerState", "type": "TEXT", "default": {"value": "on"}}
        }))
        .unwrap();

        assert_eq!(
            delta,
            SchemaDelta::add_column("Asset", ColumnSpec::new("powerState", DataType::Text).default_value("on"))
        );
        assert_eq!(delta.describe(), "add_column(Asset.powerState TEXT DEFAULT 'on')");
    }

    #[test]
    fn test_unknown_operation_is_preserved() {
        let delta = SchemaDelta::from_json(json!({"operation": "rename_column", "table": "Asset"})).unwrap();
        assert_eq!(delta.operation, DeltaOperation::Unsupported { tag: "rename_column".into() });
        assert_eq!(delta.tag(), "rename_column");
    }

    #[test]
    fn test_malformed_known_operation() {
        let err = SchemaDelta::from_json(json!({"operation": "add_column", "table": "Asset"})).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidDelta { ref tag, .. } if tag == "add_column"));

        let err = SchemaDelta::from_json(json!({"operation": "add_index", "name": "idx"})).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidDelta { .. }));
    }

    #[test]
    fn test_converters_compare_by_column() {
        let a = SchemaDelta::widen_column("Part", ColumnSpec::new("cost", DataType::Float))
            .with_converter("Cost", |v| Ok(v.clone()));
        let b = SchemaDelta::widen_column("Part", ColumnSpec::new("cost", DataType::Float))
            .with_converter("cost", |_| Ok(Value::Null));
        assert_eq!(a, b);
        assert!(a.converters.get("COST").is_some());
    }
}
