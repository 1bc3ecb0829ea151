use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{ColumnSpec, DbError, IndexSpec, Result, Row, RowId, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    name: String,
    columns: Vec<ColumnSpec>,
    rows: BTreeMap<RowId, Row>,
    next_row_id: RowId,
    indexes: Vec<IndexSpec>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Result<Self> {
        let name = name.into();
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name.eq_ignore_ascii_case(&column.name)) {
                return Err(DbError::ColumnExists(column.name.clone(), name));
            }
        }
        Ok(Self {
            name,
            columns,
            rows: BTreeMap::new(),
            next_row_id: 0,
            indexes: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name.eq_ignore_ascii_case(name))
    }

    fn require_column(&self, name: &str) -> Result<usize> {
        self.find_column_index(name)
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string(), self.name.clone()))
    }

    pub fn rename(&mut self, new_name: impl Into<String>) {
        self.name = new_name.into();
        for index in &mut self.indexes {
            index.table = self.name.clone();
        }
    }

    /// Inserts a full row in column order; values are coerced to the column types.
    pub fn insert(&mut self, row: Row) -> Result<RowId> {
        if row.len() != self.columns.len() {
            return Err(DbError::ExecutionError(format!(
                "Expected {} columns for '{}', got {}",
                self.columns.len(),
                self.name,
                row.len()
            )));
        }

        let admitted = self
            .columns
            .iter()
            .zip(row)
            .map(|(column, value)| column.admit(value))
            .collect::<Result<Row>>()?;
        self.check_uniqueness(&admitted, None)?;

        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(id, admitted);
        Ok(id)
    }

    /// Inserts a partial row; unnamed columns take their defaults.
    pub fn insert_named(&mut self, names: &[String], values: Row) -> Result<RowId> {
        if names.len() != values.len() {
            return Err(DbError::ExecutionError(format!(
                "{} values supplied for {} columns",
                values.len(),
                names.len()
            )));
        }
        let mut row = vec![Value::Null; self.columns.len()];
        for (name, value) in names.iter().zip(values) {
            let idx = self.require_column(name)?;
            row[idx] = value;
        }
        self.insert(row)
    }

    pub fn update_value(&mut self, id: RowId, column: &str, value: Value) -> Result<()> {
        let col_idx = self.require_column(column)?;
        let admitted = self.columns[col_idx].admit(value)?;

        let mut candidate = self
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::ExecutionError(format!("Row {} not found in '{}'", id, self.name)))?;
        candidate[col_idx] = admitted;
        self.check_uniqueness(&candidate, Some(id))?;

        self.rows.insert(id, candidate);
        Ok(())
    }

    pub fn delete(&mut self, id: RowId) -> bool {
        self.rows.remove(&id).is_some()
    }

    pub fn scan(&self) -> Vec<(RowId, Row)> {
        self.rows.iter().map(|(id, row)| (*id, row.clone())).collect()
    }

    /// Appends a column, filling existing rows with its default.
    pub fn add_column(&mut self, column: ColumnSpec) -> Result<()> {
        if self.find_column_index(&column.name).is_some() {
            return Err(DbError::ColumnExists(column.name, self.name.clone()));
        }
        if column.primary_key || column.unique {
            return Err(DbError::UnsupportedOperation(format!(
                "Cannot add a PRIMARY KEY or UNIQUE column '{}'",
                column.name
            )));
        }

        let fill = column.fill_value()?;
        if fill.is_null() && !column.nullable && !self.rows.is_empty() {
            return Err(DbError::ConstraintViolation(format!(
                "Cannot add a NOT NULL column '{}' with default value NULL",
                column.name
            )));
        }

        for row in self.rows.values_mut() {
            row.push(fill.clone());
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn add_index(&mut self, index: IndexSpec) -> Result<()> {
        let positions = index
            .columns
            .iter()
            .map(|c| self.require_column(c))
            .collect::<Result<Vec<_>>>()?;

        if index.unique {
            let mut seen = std::collections::HashSet::new();
            for row in self.rows.values() {
                let key: Vec<&Value> = positions.iter().map(|&p| &row[p]).collect();
                if key.iter().any(|v| v.is_null()) {
                    continue;
                }
                if !seen.insert(key) {
                    return Err(DbError::ConstraintViolation(format!(
                        "Cannot create unique index '{}': duplicate values in {}",
                        index.name,
                        index.columns.join(", ")
                    )));
                }
            }
        }

        self.indexes.push(index);
        Ok(())
    }

    /// Column position sets that must hold distinct non-NULL values.
    fn unique_keys(&self) -> Vec<(String, Vec<usize>)> {
        let mut keys: Vec<(String, Vec<usize>)> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key || c.unique)
            .map(|(i, c)| (c.name.clone(), vec![i]))
            .collect();

        for index in self.indexes.iter().filter(|i| i.unique) {
            let positions: Option<Vec<usize>> = index.columns.iter().map(|c| self.find_column_index(c)).collect();
            if let Some(positions) = positions {
                keys.push((index.columns.join(", "), positions));
            }
        }
        keys
    }

    fn check_uniqueness(&self, row: &Row, ignore_id: Option<RowId>) -> Result<()> {
        for (label, positions) in self.unique_keys() {
            if positions.iter().any(|&p| row[p].is_null()) {
                continue;
            }
            let clash = self.rows.iter().any(|(id, existing)| {
                Some(*id) != ignore_id && positions.iter().all(|&p| existing[p] == row[p])
            });
            if clash {
                return Err(DbError::ConstraintViolation(format!(
                    "UNIQUE constraint failed: {}.{}",
                    self.name, label
                )));
            }
        }
        Ok(())
    }
}
