// ============================================================================
// src/parser/adapter.rs - sqlparser AST to migration statements
// ============================================================================

use log::debug;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::core::{ColumnSpec, Condition, DataType, DbError, DefaultValue, IndexSpec, Literal, Result, Row, Value};

/// A script statement, classified by what it does to the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStatement {
    CreateTable {
        table: String,
        columns: Vec<ColumnSpec>,
        if_not_exists: bool,
    },
    AddColumn {
        table: String,
        column: ColumnSpec,
    },
    DropColumn {
        table: String,
        column: String,
    },
    CreateIndex {
        index: IndexSpec,
        if_not_exists: bool,
    },
    DropTable {
        table: String,
        if_exists: bool,
    },
    RenameTable {
        from: String,
        to: String,
    },
    /// Anything without structural meaning (DML, pragmas, vendor syntax); run verbatim.
    Other(String),
}

/// The row-level statements the in-memory store can execute.
#[derive(Debug, Clone, PartialEq)]
pub enum DmlStatement {
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Row>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        filter: Option<Condition>,
    },
    Delete {
        table: String,
        filter: Option<Condition>,
    },
}

pub struct SqlScriptAdapter {
    dialect: SQLiteDialect,
}

impl SqlScriptAdapter {
    pub fn new() -> Self {
        Self { dialect: SQLiteDialect {} }
    }

    /// Classifies a single statement.
    ///
    /// Statements sqlparser cannot read are passed through as `Other` so the
    /// store gets the final say on them.
    pub fn classify(&self, sql: &str) -> Result<Vec<ScriptStatement>> {
        let statements = match Parser::parse_sql(&self.dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                debug!("Passing through unparsed statement ({}): {}", e, sql);
                return Ok(vec![ScriptStatement::Other(sql.to_string())]);
            }
        };

        let mut classified = Vec::new();
        for stmt in statements {
            classified.extend(self.classify_statement(stmt, sql)?);
        }
        Ok(classified)
    }

    fn classify_statement(&self, stmt: sql_ast::Statement, sql: &str) -> Result<Vec<ScriptStatement>> {
        match stmt {
            sql_ast::Statement::CreateTable(create) => {
                let table = object_name(&create.name)?;
                let mut columns = create
                    .columns
                    .into_iter()
                    .map(|col| self.convert_column_def(col))
                    .collect::<Result<Vec<_>>>()?;
                let indexes = table_constraints(&table, &mut columns, &create.constraints)?;

                let mut classified = vec![ScriptStatement::CreateTable {
                    table,
                    columns,
                    if_not_exists: create.if_not_exists,
                }];
                classified.extend(indexes.into_iter().map(|index| ScriptStatement::CreateIndex {
                    index,
                    if_not_exists: true,
                }));
                Ok(classified)
            }
            sql_ast::Statement::CreateIndex(ci) => Ok(vec![self.convert_create_index(&ci)?]),
            sql_ast::Statement::AlterTable { name, operations, .. } => {
                let table = object_name(&name)?;
                operations
                    .into_iter()
                    .map(|op| self.convert_alter_operation(&table, op))
                    .collect()
            }
            sql_ast::Statement::Drop { object_type: sql_ast::ObjectType::Table, names, if_exists, .. } => names
                .iter()
                .map(|name| {
                    Ok(ScriptStatement::DropTable {
                        table: object_name(name)?,
                        if_exists,
                    })
                })
                .collect(),
            _ => Ok(vec![ScriptStatement::Other(sql.to_string())]),
        }
    }

    fn convert_alter_operation(&self, table: &str, operation: sql_ast::AlterTableOperation) -> Result<ScriptStatement> {
        match operation {
            sql_ast::AlterTableOperation::AddColumn { column_def, .. } => Ok(ScriptStatement::AddColumn {
                table: table.to_string(),
                column: self.convert_column_def(column_def)?,
            }),
            sql_ast::AlterTableOperation::DropColumn { column_names, .. } => {
                if column_names.len() != 1 {
                    return Err(DbError::UnsupportedOperation("Only single column drop supported".into()));
                }
                Ok(ScriptStatement::DropColumn {
                    table: table.to_string(),
                    column: column_names[0].value.clone(),
                })
            }
            other => {
                let text = other.to_string();
                let upper = text.to_ascii_uppercase();
                let target = ["RENAME TO ", "RENAME AS "]
                    .iter()
                    .find(|prefix| upper.starts_with(*prefix))
                    .map(|prefix| unquote(text[prefix.len()..].trim()));

                match target {
                    Some(to) => Ok(ScriptStatement::RenameTable {
                        from: table.to_string(),
                        to,
                    }),
                    None => Err(DbError::UnsupportedOperation(format!(
                        "Unsupported ALTER TABLE operation: {}",
                        text
                    ))),
                }
            }
        }
    }

    fn convert_create_index(&self, ci: &sql_ast::CreateIndex) -> Result<ScriptStatement> {
        let name = match &ci.name {
            Some(n) => object_name(n)?,
            None => return Err(DbError::ParseError("Index name is required".into())),
        };
        let table = object_name(&ci.table_name)?;

        let columns = ci.columns.iter().map(index_column).collect::<Result<Vec<_>>>()?;

        let mut index = IndexSpec::new(name, table, columns);
        index.unique = ci.unique;
        Ok(ScriptStatement::CreateIndex {
            index,
            if_not_exists: ci.if_not_exists,
        })
    }

    fn convert_column_def(&self, col: sql_ast::ColumnDef) -> Result<ColumnSpec> {
        let data_type = DataType::from_sql_name(&col.data_type.to_string())?;
        let mut spec = ColumnSpec::new(col.name.value, data_type);

        for opt in &col.options {
            match &opt.option {
                sql_ast::ColumnOption::NotNull => spec.nullable = false,
                sql_ast::ColumnOption::Null => spec.nullable = true,
                sql_ast::ColumnOption::Default(expr) => spec.default = Some(convert_default(expr)?),
                other => {
                    let text = other.to_string().to_ascii_uppercase();
                    if text.starts_with("PRIMARY KEY") {
                        spec = spec.primary_key();
                    } else if text.starts_with("UNIQUE") {
                        spec.unique = true;
                    }
                }
            }
        }

        Ok(spec)
    }

    /// Parses `INSERT ... VALUES`, `UPDATE ... SET` or `DELETE FROM`.
    pub fn parse_dml(&self, sql: &str) -> Result<DmlStatement> {
        let mut statements = Parser::parse_sql(&self.dialect, sql).map_err(|e| DbError::ParseError(e.to_string()))?;
        if statements.len() != 1 {
            return Err(DbError::ParseError(format!(
                "Expected exactly one statement, found {}",
                statements.len()
            )));
        }

        match statements.remove(0) {
            sql_ast::Statement::Insert(insert) => self.convert_insert(insert),
            sql_ast::Statement::Update { table, assignments, selection, .. } => {
                self.convert_update(table, assignments, selection)
            }
            sql_ast::Statement::Delete(delete) => self.convert_delete(delete),
            other => Err(DbError::UnsupportedOperation(format!("Statement not supported: {}", other))),
        }
    }

    fn convert_insert(&self, insert: sql_ast::Insert) -> Result<DmlStatement> {
        let qualified = insert.table.to_string();
        let table = unquote(qualified.rsplit('.').next().unwrap_or(&qualified));

        let columns = if insert.columns.is_empty() {
            None
        } else {
            Some(insert.columns.into_iter().map(|id| id.value).collect())
        };

        let Some(source) = insert.source else {
            return Err(DbError::UnsupportedOperation("INSERT without VALUES is not supported".into()));
        };
        let sql_ast::SetExpr::Values(vals) = *source.body else {
            return Err(DbError::UnsupportedOperation("Only VALUES clause supported".into()));
        };

        let rows = vals
            .rows
            .iter()
            .map(|row| row.iter().map(convert_literal).collect::<Result<Row>>())
            .collect::<Result<Vec<_>>>()?;

        Ok(DmlStatement::Insert { table, columns, rows })
    }

    fn convert_update(
        &self,
        table: sql_ast::TableWithJoins,
        assignments: Vec<sql_ast::Assignment>,
        selection: Option<sql_ast::Expr>,
    ) -> Result<DmlStatement> {
        let table = match table.relation {
            sql_ast::TableFactor::Table { name, .. } => object_name(&name)?,
            _ => {
                return Err(DbError::UnsupportedOperation(
                    "Complex table references not supported in UPDATE".into(),
                ));
            }
        };

        let assignments = assignments
            .into_iter()
            .map(|assign| {
                let column = match assign.target {
                    sql_ast::AssignmentTarget::ColumnName(col_name) => object_name(&col_name)?,
                    _ => {
                        return Err(DbError::UnsupportedOperation(
                            "Only simple column names supported in UPDATE".into(),
                        ));
                    }
                };
                Ok((column, convert_literal(&assign.value)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let filter = selection.as_ref().map(convert_condition).transpose()?;

        Ok(DmlStatement::Update {
            table,
            assignments,
            filter,
        })
    }

    fn convert_delete(&self, delete: sql_ast::Delete) -> Result<DmlStatement> {
        let tables = match delete.from {
            sql_ast::FromTable::WithFromKeyword(tables) | sql_ast::FromTable::WithoutKeyword(tables) => tables,
        };
        let Some(first) = tables.first() else {
            return Err(DbError::ParseError("DELETE requires a table name".into()));
        };
        let table = match &first.relation {
            sql_ast::TableFactor::Table { name, .. } => object_name(name)?,
            _ => {
                return Err(DbError::UnsupportedOperation(
                    "Complex table references not supported in DELETE".into(),
                ));
            }
        };

        let filter = delete.selection.as_ref().map(convert_condition).transpose()?;
        Ok(DmlStatement::Delete { table, filter })
    }
}

impl Default for SqlScriptAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn unquote(raw: &str) -> String {
    raw.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']')).to_string()
}

fn object_name(name: &sql_ast::ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|part| unquote(&part.to_string()))
        .ok_or_else(|| DbError::ParseError("Invalid object name".into()))
}

fn index_column(column: &sql_ast::IndexColumn) -> Result<String> {
    match &column.column.expr {
        sql_ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
        other => Err(DbError::UnsupportedOperation(format!(
            "Index column must be an identifier, got {}",
            other
        ))),
    }
}

/// Folds table-level `PRIMARY KEY (..)` and `UNIQUE (..)` into the table.
///
/// A single key column takes the flag itself; a composite key becomes a
/// unique index created right after the table. Foreign keys and checks are
/// not enforced by the store and are dropped.
fn table_constraints(
    table: &str,
    columns: &mut [ColumnSpec],
    constraints: &[sql_ast::TableConstraint],
) -> Result<Vec<IndexSpec>> {
    let mut indexes = Vec::new();

    for constraint in constraints {
        let (name, keys, primary) = match constraint {
            sql_ast::TableConstraint::Unique { name, columns: keys, .. } => (name, keys, false),
            sql_ast::TableConstraint::PrimaryKey { name, columns: keys, .. } => (name, keys, true),
            other => {
                debug!("Ignoring constraint on {}: {}", table, other);
                continue;
            }
        };
        let keys = keys.iter().map(index_column).collect::<Result<Vec<_>>>()?;

        for key in &keys {
            let column = columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(key))
                .ok_or_else(|| DbError::ColumnNotFound(key.clone(), table.to_string()))?;
            if keys.len() == 1 {
                if primary {
                    column.primary_key = true;
                    column.nullable = false;
                } else {
                    column.unique = true;
                }
            } else if primary {
                column.nullable = false;
            }
        }
        if keys.len() == 1 {
            continue;
        }

        let suffix = if primary { "pkey" } else { "key" };
        let name = name
            .as_ref()
            .map(|ident| ident.value.clone())
            .unwrap_or_else(|| format!("{}_{}_{}", table, keys.join("_"), suffix));
        let mut index = IndexSpec::new(name, table, keys);
        index.unique = true;
        indexes.push(index);
    }

    Ok(indexes)
}

fn column_name(expr: &sql_ast::Expr) -> Result<String> {
    match expr {
        sql_ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
        sql_ast::Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| DbError::ParseError("Empty column reference".into())),
        other => Err(DbError::UnsupportedOperation(format!("Expected a column name, got {}", other))),
    }
}

fn convert_value(val: &sql_ast::Value) -> Result<Value> {
    match val {
        sql_ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::Integer(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(DbError::ParseError(format!("Invalid number: {}", n)))
            }
        }
        sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => Ok(Value::Text(s.clone())),
        sql_ast::Value::Boolean(b) => Ok(Value::Boolean(*b)),
        sql_ast::Value::Null => Ok(Value::Null),
        other => Err(DbError::UnsupportedOperation(format!("Unsupported literal: {}", other))),
    }
}

fn convert_literal(expr: &sql_ast::Expr) -> Result<Value> {
    match expr {
        sql_ast::Expr::Value(val) => convert_value(&val.value),
        sql_ast::Expr::Nested(inner) => convert_literal(inner),
        sql_ast::Expr::UnaryOp { op: sql_ast::UnaryOperator::Minus, expr } => match convert_literal(expr)? {
            Value::Integer(i) => Ok(Value::Integer(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(DbError::TypeMismatch(format!("Cannot negate {}", other.type_name()))),
        },
        other => Err(DbError::UnsupportedOperation(format!(
            "Only literal values are supported, got {}",
            other
        ))),
    }
}

fn convert_default(expr: &sql_ast::Expr) -> Result<DefaultValue> {
    let text = expr.to_string().to_ascii_lowercase();
    if text == "current_timestamp" || text.contains("'now'") {
        return Ok(DefaultValue::CurrentTimestamp);
    }
    Ok(DefaultValue::Value(Literal(convert_literal(expr)?)))
}

fn convert_condition(expr: &sql_ast::Expr) -> Result<Condition> {
    match expr {
        sql_ast::Expr::Nested(inner) => convert_condition(inner),
        sql_ast::Expr::BinaryOp { left, op, right } => match op {
            sql_ast::BinaryOperator::And => {
                Ok(Condition::All(vec![convert_condition(left)?, convert_condition(right)?]))
            }
            sql_ast::BinaryOperator::Eq => Ok(Condition::Equals {
                column: column_name(left)?,
                value: Literal(convert_literal(right)?),
            }),
            other => Err(DbError::UnsupportedOperation(format!("Unsupported operator in WHERE: {}", other))),
        },
        sql_ast::Expr::IsNull(inner) => Ok(Condition::IsNull { column: column_name(inner)? }),
        sql_ast::Expr::IsNotNull(inner) => Ok(Condition::NotNull { column: column_name(inner)? }),
        sql_ast::Expr::InList { expr, list, negated: false } => Ok(Condition::In {
            column: column_name(expr)?,
            values: list
                .iter()
                .map(|e| convert_literal(e).map(Literal))
                .collect::<Result<Vec<_>>>()?,
        }),
        other => Err(DbError::UnsupportedOperation(format!("Unsupported WHERE clause: {}", other))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_one(sql: &str) -> ScriptStatement {
        let mut statements = SqlScriptAdapter::new().classify(sql).unwrap();
        assert_eq!(statements.len(), 1, "{sql}");
        statements.remove(0)
    }

    #[test]
    fn test_classify_create_table() {
        let stmt = classify_one(
            "CREATE TABLE IF NOT EXISTS PMSchedule (
                id TEXT PRIMARY KEY,
                assetId TEXT NOT NULL,
                frequencyDays INTEGER DEFAULT 30,
                createdAt DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
        );
        let ScriptStatement::CreateTable { table, columns, if_not_exists } = stmt else {
            panic!("expected CREATE TABLE");
        };
        assert_eq!(table, "PMSchedule");
        assert!(if_not_exists);
        assert!(columns[0].primary_key);
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].data_type, DataType::Integer);
        assert_eq!(columns[2].default, Some(DefaultValue::Value(Literal(Value::Integer(30)))));
        assert_eq!(columns[3].default, Some(DefaultValue::CurrentTimestamp));
    }

    #[test]
    fn test_table_constraints_are_kept() {
        let statements = SqlScriptAdapter::new()
            .classify(
                "CREATE TABLE MaintenancePart (
                    scheduleId TEXT,
                    partId TEXT,
                    sapNumber TEXT,
                    quantity INTEGER,
                    PRIMARY KEY (scheduleId, partId),
                    UNIQUE (sapNumber),
                    FOREIGN KEY (partId) REFERENCES AssetPart(id)
                )",
            )
            .unwrap();
        assert_eq!(statements.len(), 2);

        let ScriptStatement::CreateTable { columns, .. } = &statements[0] else {
            panic!("expected CREATE TABLE");
        };
        assert!(!columns[0].nullable && !columns[1].nullable);
        assert!(!columns[0].primary_key);
        assert!(columns[2].unique);

        let ScriptStatement::CreateIndex { index, if_not_exists } = &statements[1] else {
            panic!("expected the composite key index");
        };
        assert!(*if_not_exists);
        assert!(index.unique);
        assert_eq!(index.name, "MaintenancePart_scheduleId_partId_pkey");
        assert_eq!(index.columns, vec!["scheduleId".to_string(), "partId".to_string()]);
    }

    #[test]
    fn test_constraint_on_unknown_column() {
        let err = SqlScriptAdapter::new()
            .classify("CREATE TABLE Vendor (id TEXT, UNIQUE (code))")
            .unwrap_err();
        assert!(matches!(err, DbError::ColumnNotFound(..)));
    }

    #[test]
    fn test_classify_alter_table() {
        let stmt = classify_one("ALTER TABLE Asset ADD COLUMN powerState TEXT DEFAULT 'on'");
        assert_eq!(
            stmt,
            ScriptStatement::AddColumn {
                table: "Asset".into(),
                column: ColumnSpec::new("powerState", DataType::Text).default_value("on"),
            }
        );

        let stmt = classify_one("ALTER TABLE AssetPart_new RENAME TO AssetPart");
        assert_eq!(
            stmt,
            ScriptStatement::RenameTable {
                from: "AssetPart_new".into(),
                to: "AssetPart".into(),
            }
        );
    }

    #[test]
    fn test_classify_index_and_drop() {
        let stmt = classify_one("CREATE UNIQUE INDEX IF NOT EXISTS idx_part_number ON Part(partNumber)");
        let ScriptStatement::CreateIndex { index, if_not_exists } = stmt else {
            panic!("expected CREATE INDEX");
        };
        assert!(index.unique && if_not_exists);
        assert_eq!(index.columns, vec!["partNumber".to_string()]);

        assert_eq!(
            classify_one("DROP TABLE IF EXISTS AssetPart_old"),
            ScriptStatement::DropTable {
                table: "AssetPart_old".into(),
                if_exists: true,
            }
        );
    }

    #[test]
    fn test_dml_passes_through() {
        let sql = "UPDATE Asset SET powerState = 'off' WHERE status = 'down'";
        assert_eq!(classify_one(sql), ScriptStatement::Other(sql.to_string()));
    }

    #[test]
    fn test_parse_update_with_filter() {
        let stmt = SqlScriptAdapter::new()
            .parse_dml("UPDATE Asset SET powerState = 'off' WHERE status = 'down' AND powerState IS NULL")
            .unwrap();
        let DmlStatement::Update { table, assignments, filter } = stmt else {
            panic!("expected UPDATE");
        };
        assert_eq!(table, "Asset");
        assert_eq!(assignments, vec![("powerState".to_string(), Value::Text("off".into()))]);
        assert_eq!(
            filter,
            Some(Condition::All(vec![
                Condition::equals("status", "down"),
                Condition::IsNull { column: "powerState".into() },
            ]))
        );
    }

    #[test]
    fn test_parse_insert_rows() {
        let stmt = SqlScriptAdapter::new()
            .parse_dml("INSERT INTO Organization (id, name, seats) VALUES ('org-1', 'Acme', 25), ('org-2', 'Globex', -1)")
            .unwrap();
        let DmlStatement::Insert { table, columns, rows } = stmt else {
            panic!("expected INSERT");
        };
        assert_eq!(table, "Organization");
        assert_eq!(columns.map(|c| c.len()), Some(3));
        assert_eq!(rows[1][2], Value::Integer(-1));
    }
}
