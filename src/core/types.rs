use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{DataType, DbError, Literal, Result, Value};

pub type Row = Vec<Value>;

/// Identifies a stored row for the lifetime of its table.
pub type RowId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Value(Literal),
    CurrentTimestamp,
}

impl DefaultValue {
    pub fn resolve(&self) -> Value {
        match self {
            Self::Value(literal) => literal.0.clone(),
            Self::CurrentTimestamp => Value::Timestamp(Utc::now().naive_utc()),
        }
    }
}

impl fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(Literal(Value::Text(s))) => write!(f, "'{}'", s),
            Self::Value(literal) => write!(f, "{}", literal.0),
            Self::CurrentTimestamp => write!(f, "CURRENT_TIMESTAMP"),
        }
    }
}

/// Shape of a single column, both as desired by a migration and as found live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Value(Literal(value.into())));
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(DefaultValue::CurrentTimestamp);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Same name, type and nullability. Defaults and keys are not compared.
    pub fn same_shape(&self, other: &ColumnSpec) -> bool {
        self.name == other.name && self.data_type == other.data_type && self.nullable == other.nullable
    }

    /// The value a row receives when nothing is supplied for this column.
    pub fn fill_value(&self) -> Result<Value> {
        match &self.default {
            Some(default) => default.resolve().cast_to(&self.data_type),
            None => Ok(Value::Null),
        }
    }

    /// Coerces `value` to the column type, substituting the default for `NULL`.
    pub fn admit(&self, value: Value) -> Result<Value> {
        let value = if value.is_null() { self.fill_value()? } else { value.cast_to(&self.data_type)? };

        if value.is_null() && !self.nullable {
            return Err(DbError::ConstraintViolation(format!(
                "Column '{}' cannot be NULL",
                self.name
            )));
        }

        Ok(value)
    }
}

impl fmt::Display for ColumnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.data_type)?;
        if self.primary_key {
            write!(f, " PRIMARY KEY")?;
        } else if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        if self.unique {
            write!(f, " UNIQUE")?;
        }
        if let Some(default) = &self.default {
            write!(f, " DEFAULT {}", default)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}INDEX {} ON {}({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            self.columns.join(", ")
        )
    }
}

/// Row filter shared by `WHERE` clauses and backfill predicates.
///
/// Literals are coerced to the column's type before comparing, so `'3'`
/// matches an `INTEGER` 3. A literal that cannot be coerced matches nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals { column: String, value: Literal },
    IsNull { column: String },
    NotNull { column: String },
    In { column: String, values: Vec<Literal> },
    All(Vec<Condition>),
}

impl Condition {
    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            column: column.into(),
            value: Literal(value.into()),
        }
    }

    pub fn is_in(column: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Self::In {
            column: column.into(),
            values: values.into_iter().map(Literal).collect(),
        }
    }

    pub fn matches(&self, columns: &[ColumnSpec], row: &Row) -> Result<bool> {
        match self {
            Self::Equals { column, value } => {
                let (spec, current) = lookup(columns, row, column)?;
                Ok(literal_matches(spec, current, value))
            }
            Self::IsNull { column } => Ok(lookup(columns, row, column)?.1.is_null()),
            Self::NotNull { column } => Ok(!lookup(columns, row, column)?.1.is_null()),
            Self::In { column, values } => {
                let (spec, current) = lookup(columns, row, column)?;
                Ok(values.iter().any(|v| literal_matches(spec, current, v)))
            }
            Self::All(conditions) => {
                for condition in conditions {
                    if !condition.matches(columns, row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

fn lookup<'a>(columns: &'a [ColumnSpec], row: &'a Row, name: &str) -> Result<(&'a ColumnSpec, &'a Value)> {
    columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(name))
        .map(|i| (&columns[i], &row[i]))
        .ok_or_else(|| DbError::ColumnNotFound(name.to_string(), "<filter>".to_string()))
}

fn literal_matches(column: &ColumnSpec, current: &Value, literal: &Literal) -> bool {
    !current.is_null()
        && literal
            .0
            .cast_to(&column.data_type)
            .is_ok_and(|wanted| &wanted == current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_applies_default_and_nullability() {
        let column = ColumnSpec::new("unitOfMeasure", DataType::Text).default_value("EA");
        assert_eq!(column.admit(Value::Null).unwrap(), Value::Text("EA".into()));

        let required = ColumnSpec::new("assetId", DataType::Text).not_null();
        assert!(required.admit(Value::Null).is_err());
        assert_eq!(required.admit(Value::Integer(9)).unwrap(), Value::Text("9".into()));
    }

    #[test]
    fn test_column_spec_from_json() {
        let column: ColumnSpec = serde_json::from_str(
            r#"{"name": "criticalityLevel", "type": "TEXT", "default": {"value": "C"}}"#,
        )
        .unwrap();
        assert!(column.nullable);
        assert_eq!(column.to_string(), "criticalityLevel TEXT DEFAULT 'C'");

        let created: ColumnSpec =
            serde_json::from_str(r#"{"name": "createdAt", "type": "DATETIME", "default": "current_timestamp"}"#).unwrap();
        assert_eq!(created.default, Some(DefaultValue::CurrentTimestamp));
    }

    #[test]
    fn test_condition_coerces_literals() {
        let columns = vec![
            ColumnSpec::new("id", DataType::Integer),
            ColumnSpec::new("status", DataType::Text),
        ];
        let row: Row = vec![Value::Integer(3), Value::Text("down".into())];

        assert!(Condition::equals("id", "3").matches(&columns, &row).unwrap());
        assert!(Condition::is_in("STATUS", [Value::from("maintenance"), Value::from("down")]).matches(&columns, &row).unwrap());
        assert!(!Condition::equals("id", "three").matches(&columns, &row).unwrap());
        assert!(Condition::equals("missing", 1i64).matches(&columns, &row).is_err());
    }

    #[test]
    fn test_condition_from_json() {
        let condition: Condition =
            serde_json::from_str(r#"{"in": {"column": "status", "values": ["maintenance", "down"]}}"#).unwrap();
        assert_eq!(condition, Condition::is_in("status", [Value::from("maintenance"), Value::from("down")]));
    }
}
