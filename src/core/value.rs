use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result};

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "REAL",
            Self::Text(_) => "TEXT",
            Self::Boolean(_) => "BOOLEAN",
            Self::Timestamp(_) => "DATETIME",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts the value to `target` using the store's default coercion rules.
    ///
    /// `NULL` always converts to `NULL`; nullability is the column's concern.
    pub fn cast_to(&self, target: &DataType) -> Result<Value> {
        let mismatch = || {
            DbError::TypeMismatch(format!(
                "cannot convert {} '{}' to {}",
                self.type_name(),
                self,
                target
            ))
        };

        let converted = match (self, target) {
            (Self::Null, _) => Self::Null,

            (Self::Integer(i), DataType::Integer) => Self::Integer(*i),
            (Self::Integer(i), DataType::Float) => Self::Float(*i as f64),
            (Self::Integer(i), DataType::Boolean) => match i {
                0 => Self::Boolean(false),
                1 => Self::Boolean(true),
                _ => return Err(mismatch()),
            },

            (Self::Float(f), DataType::Float) => Self::Float(*f),
            (Self::Float(f), DataType::Integer) => {
                if f.is_finite() && f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Self::Integer(*f as i64)
                } else {
                    return Err(mismatch());
                }
            }

            (Self::Boolean(b), DataType::Boolean) => Self::Boolean(*b),
            (Self::Boolean(b), DataType::Integer) => Self::Integer(i64::from(*b)),

            (Self::Timestamp(ts), DataType::Timestamp) => Self::Timestamp(*ts),

            (Self::Text(s), DataType::Text) => Self::Text(s.clone()),
            (Self::Text(s), DataType::Integer) => {
                Self::Integer(s.trim().parse::<i64>().map_err(|_| mismatch())?)
            }
            (Self::Text(s), DataType::Float) => {
                Self::Float(s.trim().parse::<f64>().map_err(|_| mismatch())?)
            }
            (Self::Text(s), DataType::Boolean) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Self::Boolean(true),
                "false" | "0" => Self::Boolean(false),
                _ => return Err(mismatch()),
            },
            (Self::Text(s), DataType::Timestamp) => {
                Self::Timestamp(parse_timestamp(s).ok_or_else(mismatch)?)
            }

            (other, DataType::Text) => Self::Text(other.to_string()),

            _ => return Err(mismatch()),
        };

        Ok(converted)
    }
}

pub fn parse_timestamp(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(input, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                (a - b).abs() < f64::EPSILON
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Integer(i), Self::Float(f)) | (Self::Float(f), Self::Integer(i)) => {
                (*i as f64 - f).abs() < f64::EPSILON
            }
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),

            (Self::Integer(a), Self::Integer(b)) => a.partial_cmp(b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(i), Self::Float(f)) => (*i as f64).partial_cmp(f),
            (Self::Float(f), Self::Integer(i)) => f.partial_cmp(&(*i as f64)),

            (Self::Text(a), Self::Text(b)) => a.partial_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.partial_cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.partial_cmp(b),

            _ => None,
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0u8.hash(state),
            // Integers hash through f64 bits so that 1 and 1.0 collide, matching Eq.
            Self::Integer(i) => {
                1u8.hash(state);
                (*i as f64).to_bits().hash(state);
            }
            Self::Float(f) => {
                1u8.hash(state);
                f.to_bits().hash(state);
            }
            Self::Text(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Self::Boolean(b) => {
                4u8.hash(state);
                b.hash(state);
            }
            Self::Timestamp(ts) => {
                5u8.hash(state);
                ts.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(fl) => write!(f, "{}", fl),
            Self::Text(s) => write!(f, "{}", s),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(ts: NaiveDateTime) -> Self {
        Self::Timestamp(ts)
    }
}

/// Column types, named after SQLite's type affinities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
}

impl DataType {
    /// Resolves a declared SQL type name (`VARCHAR(255)`, `REAL`, `DATETIME`, ...).
    pub fn from_sql_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let resolved = if upper.starts_with("BOOL") {
            Self::Boolean
        } else if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") || upper == "STRING" || upper == "UUID" || upper == "JSON" {
            Self::Text
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") || upper.contains("NUMERIC") || upper.contains("DECIMAL") {
            Self::Float
        } else if upper.contains("DATE") || upper.contains("TIME") {
            Self::Timestamp
        } else {
            return Err(DbError::TypeMismatch(format!("Unsupported data type: {}", name)));
        };
        Ok(resolved)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "INTEGER"),
            Self::Float => write!(f, "REAL"),
            Self::Text => write!(f, "TEXT"),
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::Timestamp => write!(f, "DATETIME"),
        }
    }
}

// Serialized as the SQL type name so migration files read naturally.
impl Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DataType::from_sql_name(&raw).map_err(serde::de::Error::custom)
    }
}

/// A [`Value`] written the way migration files write it: a bare JSON scalar.
///
/// Timestamps travel as text and are coerced by the column they land in.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal(pub Value);

impl Serialize for Literal {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.0 {
            Value::Null => serializer.serialize_none(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Literal {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let value = match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a scalar literal, got {}",
                    other
                )));
            }
        };
        Ok(Literal(value))
    }
}

impl From<Value> for Literal {
    fn from(value: Value) -> Self {
        Literal(value)
    }
}
