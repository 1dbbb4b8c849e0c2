//! In-memory storage adapter. Evaluates the statements produced by `SqlBuilder`
//! (single-table SELECT/COUNT, INSERT, UPDATE, DELETE, CREATE TABLE) against
//! tables held in process memory.
//!
//! Semantics: comparisons with NULL are false, booleans compare equal to 0/1,
//! LIKE is case-insensitive, ORDER BY is stable with NULLs first.

use crate::error::StorageError;
use crate::storage::{ColumnDefinition, ColumnType, ExecuteResult, Row, StorageAdapter};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Number, Value};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::{Mutex, RwLock};

#[derive(Clone, Debug, Default)]
struct Table {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Row>,
}

impl Table {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

type Tables = HashMap<String, Table>;

#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    snapshot: Mutex<Option<Tables>>,
    connected: AtomicBool,
    in_tx: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.connected.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotConnected)
        }
    }

    fn parse(sql: &str) -> Result<sql_ast::Statement, StorageError> {
        let mut statements =
            Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| StorageError::Parse(e.to_string()))?;
        if statements.len() != 1 {
            return Err(StorageError::Unsupported(format!(
                "expected one statement, got {}",
                statements.len()
            )));
        }
        Ok(statements.remove(0))
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connected.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::SeqCst)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        self.ensure_connected()?;
        tracing::debug!(sql = %sql, params = ?params, "query");
        let stmt = Self::parse(sql)?;
        let sql_ast::Statement::Query(query) = stmt else {
            return Err(StorageError::Unsupported("query expects SELECT".into()));
        };
        let mut binder = Binder::new(params);
        let select = SelectPlan::from_query(*query, &mut binder)?;
        let tables = self.tables.read().await;
        let table = tables
            .get(&select.table)
            .ok_or_else(|| StorageError::TableNotFound(select.table.clone()))?;
        select.run(table)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult, StorageError> {
        self.ensure_connected()?;
        tracing::debug!(sql = %sql, params = ?params, "execute");
        let stmt = Self::parse(sql)?;
        let mut binder = Binder::new(params);
        match stmt {
            sql_ast::Statement::Insert(insert) => {
                let table_name = object_name(&insert.table.to_string());
                let columns: Vec<String> = insert.columns.into_iter().map(|c| c.value).collect();
                let Some(source) = insert.source else {
                    return Err(StorageError::Unsupported("INSERT without VALUES".into()));
                };
                let sql_ast::SetExpr::Values(values) = *source.body else {
                    return Err(StorageError::Unsupported("INSERT supports only VALUES".into()));
                };
                let mut rows = Vec::with_capacity(values.rows.len());
                for exprs in values.rows {
                    if exprs.len() != columns.len() {
                        return Err(StorageError::Parse("column and value counts differ".into()));
                    }
                    let mut row = Row::new();
                    for (col, expr) in columns.iter().zip(exprs) {
                        row.insert(col.clone(), binder.literal(expr)?);
                    }
                    rows.push(row);
                }
                let mut tables = self.tables.write().await;
                let table = tables
                    .get_mut(&table_name)
                    .ok_or_else(|| StorageError::TableNotFound(table_name.clone()))?;
                if let Some(col) = columns.iter().find(|c| !table.has_column(c)) {
                    return Err(StorageError::UnknownColumn {
                        table: table_name.clone(),
                        column: col.clone(),
                    });
                }
                let keys: Vec<String> = table
                    .columns
                    .iter()
                    .filter(|c| c.primary_key)
                    .map(|c| c.name.clone())
                    .collect();
                let mut staged: Vec<Row> = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut full = Row::new();
                    for c in &table.columns {
                        full.insert(c.name.clone(), Value::Null);
                    }
                    full.extend(row);
                    for key in &keys {
                        let value = full.get(key).filter(|v| !v.is_null());
                        let Some(value) = value else { continue };
                        if table.rows.iter().chain(staged.iter()).any(|r| r.get(key) == Some(value)) {
                            return Err(StorageError::DuplicateKey {
                                table: table_name.clone(),
                                column: key.clone(),
                                value: match value {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                },
                            });
                        }
                    }
                    staged.push(full);
                }
                let changes = staged.len() as u64;
                let last_insert_id = staged.last().and_then(|r| r.get("id")).cloned().filter(|v| !v.is_null());
                table.rows.extend(staged);
                Ok(ExecuteResult {
                    changes,
                    last_insert_id,
                })
            }
            sql_ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                let table_name = table_factor_name(&table.relation)?;
                let mut sets = Vec::with_capacity(assignments.len());
                for a in assignments {
                    let column = match a.target {
                        sql_ast::AssignmentTarget::ColumnName(name) => object_name(&name.to_string()),
                        _ => return Err(StorageError::Unsupported("tuple assignment".into())),
                    };
                    sets.push((column, binder.literal(a.value)?));
                }
                let cond = selection.map(|e| Cond::from_expr(e, &mut binder)).transpose()?;
                let mut tables = self.tables.write().await;
                let table = tables
                    .get_mut(&table_name)
                    .ok_or_else(|| StorageError::TableNotFound(table_name.clone()))?;
                if let Some((col, _)) = sets.iter().find(|(c, _)| !table.has_column(c)) {
                    return Err(StorageError::UnknownColumn {
                        table: table_name.clone(),
                        column: col.clone(),
                    });
                }
                let mut changes = 0;
                for row in table.rows.iter_mut() {
                    if cond.as_ref().map(|c| c.eval(row)).unwrap_or(true) {
                        for (col, v) in &sets {
                            row.insert(col.clone(), v.clone());
                        }
                        changes += 1;
                    }
                }
                Ok(ExecuteResult {
                    changes,
                    last_insert_id: None,
                })
            }
            sql_ast::Statement::Delete(delete) => {
                let from = match delete.from {
                    sql_ast::FromTable::WithFromKeyword(t) | sql_ast::FromTable::WithoutKeyword(t) => t,
                };
                let relation = from
                    .first()
                    .map(|t| &t.relation)
                    .ok_or_else(|| StorageError::Parse("DELETE requires a table".into()))?;
                let table_name = table_factor_name(relation)?;
                let cond = delete.selection.map(|e| Cond::from_expr(e, &mut binder)).transpose()?;
                let mut tables = self.tables.write().await;
                let table = tables
                    .get_mut(&table_name)
                    .ok_or_else(|| StorageError::TableNotFound(table_name.clone()))?;
                let before = table.rows.len();
                table
                    .rows
                    .retain(|row| !cond.as_ref().map(|c| c.eval(row)).unwrap_or(true));
                Ok(ExecuteResult {
                    changes: (before - table.rows.len()) as u64,
                    last_insert_id: None,
                })
            }
            sql_ast::Statement::CreateTable(create) => {
                let name = object_name(&create.name.to_string());
                let columns = create
                    .columns
                    .iter()
                    .map(|c| {
                        let options: Vec<String> = c.options.iter().map(|o| o.option.to_string().to_uppercase()).collect();
                        let primary_key = options.iter().any(|o| o.contains("PRIMARY KEY"));
                        ColumnDefinition {
                            name: c.name.value.clone(),
                            column_type: column_type_from_sql(&c.data_type.to_string()),
                            nullable: !primary_key && !options.iter().any(|o| o == "NOT NULL"),
                            primary_key,
                        }
                    })
                    .collect::<Vec<_>>();
                let mut tables = self.tables.write().await;
                if tables.contains_key(&name) {
                    if create.if_not_exists {
                        return Ok(ExecuteResult::default());
                    }
                    return Err(StorageError::TableExists(name));
                }
                tables.insert(
                    name,
                    Table {
                        columns,
                        rows: Vec::new(),
                    },
                );
                Ok(ExecuteResult::default())
            }
            other => Err(StorageError::Unsupported(other.to_string())),
        }
    }

    async fn begin(&self) -> Result<(), StorageError> {
        self.ensure_connected()?;
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.is_some() {
            return Err(StorageError::Transaction("transaction already open".into()));
        }
        *snapshot = Some(self.tables.read().await.clone());
        self.in_tx.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.take().is_none() {
            return Err(StorageError::Transaction("no open transaction".into()));
        }
        self.in_tx.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.lock().await;
        let Some(saved) = snapshot.take() else {
            return Err(StorageError::Transaction("no open transaction".into()));
        };
        *self.tables.write().await = saved;
        self.in_tx.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(AtomicOrdering::SeqCst)
    }

    async fn table_exists(&self, name: &str) -> Result<bool, StorageError> {
        self.ensure_connected()?;
        Ok(self.tables.read().await.contains_key(name))
    }

    async fn create_table(&self, name: &str, columns: &[ColumnDefinition]) -> Result<(), StorageError> {
        self.ensure_connected()?;
        let mut tables = self.tables.write().await;
        if tables.contains_key(name) {
            return Err(StorageError::TableExists(name.to_string()));
        }
        tables.insert(
            name.to_string(),
            Table {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_table_columns(&self, name: &str) -> Result<Vec<ColumnDefinition>, StorageError> {
        self.ensure_connected()?;
        self.tables
            .read()
            .await
            .get(name)
            .map(|t| t.columns.clone())
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }
}

/// Strip identifier quoting from a rendered object name.
fn object_name(raw: &str) -> String {
    raw.replace(['"', '`'], "")
}

fn table_factor_name(factor: &sql_ast::TableFactor) -> Result<String, StorageError> {
    match factor {
        sql_ast::TableFactor::Table { name, .. } => Ok(object_name(&name.to_string())),
        _ => Err(StorageError::Unsupported("only plain table references".into())),
    }
}

fn column_type_from_sql(raw: &str) -> ColumnType {
    let t = raw.to_uppercase();
    if t.contains("INT") {
        ColumnType::Integer
    } else if t.contains("REAL") || t.contains("DOUBLE") || t.contains("FLOAT") || t.contains("NUMERIC") {
        ColumnType::Real
    } else if t.contains("BOOL") {
        ColumnType::Boolean
    } else {
        ColumnType::Text
    }
}

/// Binds `?` placeholders in textual order and `$n` by index.
struct Binder<'a> {
    params: &'a [Value],
    next: usize,
}

impl<'a> Binder<'a> {
    fn new(params: &'a [Value]) -> Self {
        Binder { params, next: 0 }
    }

    fn bind(&mut self, placeholder: &str) -> Result<Value, StorageError> {
        let index = match placeholder.strip_prefix('$') {
            Some(n) => n
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .ok_or_else(|| StorageError::Parse(format!("bad placeholder {}", placeholder)))?,
            None => {
                self.next += 1;
                self.next - 1
            }
        };
        self.params
            .get(index)
            .cloned()
            .ok_or(StorageError::MissingParameter(index + 1))
    }

    fn value(&mut self, v: &sql_ast::Value) -> Result<Value, StorageError> {
        Ok(match v {
            sql_ast::Value::Number(n, _) => parse_number(n)?,
            sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => Value::String(s.clone()),
            sql_ast::Value::Boolean(b) => Value::Bool(*b),
            sql_ast::Value::Null => Value::Null,
            sql_ast::Value::Placeholder(p) => self.bind(p)?,
            other => return Err(StorageError::Unsupported(format!("literal {}", other))),
        })
    }

    /// A value expression: literal or placeholder.
    fn literal(&mut self, expr: sql_ast::Expr) -> Result<Value, StorageError> {
        match expr {
            sql_ast::Expr::Value(v) => self.value(&v.value),
            sql_ast::Expr::Nested(inner) => self.literal(*inner),
            other => Err(StorageError::Unsupported(format!("expected a value, got {}", other))),
        }
    }

    fn operand(&mut self, expr: sql_ast::Expr) -> Result<Operand, StorageError> {
        match expr {
            sql_ast::Expr::Identifier(ident) => Ok(Operand::Column(ident.value)),
            sql_ast::Expr::CompoundIdentifier(parts) => parts
                .into_iter()
                .last()
                .map(|i| Operand::Column(i.value))
                .ok_or_else(|| StorageError::Parse("empty identifier".into())),
            sql_ast::Expr::Nested(inner) => self.operand(*inner),
            other => self.literal(other).map(Operand::Literal),
        }
    }
}

fn parse_number(n: &str) -> Result<Value, StorageError> {
    if let Ok(i) = n.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    n.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StorageError::Parse(format!("bad number {}", n)))
}

#[derive(Debug)]
enum Operand {
    Column(String),
    Literal(Value),
}

impl Operand {
    fn resolve<'a>(&'a self, row: &'a Row) -> &'a Value {
        match self {
            Operand::Column(c) => row.get(c).unwrap_or(&Value::Null),
            Operand::Literal(v) => v,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug)]
enum Cond {
    Const(bool),
    Compare { left: Operand, op: CmpOp, right: Operand },
    /// `compiled` is set when the pattern is a literal.
    Like {
        expr: Operand,
        pattern: Operand,
        compiled: Option<Regex>,
        negated: bool,
    },
    InList { expr: Operand, list: Vec<Operand>, negated: bool },
    IsNull { expr: Operand, negated: bool },
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    Not(Box<Cond>),
}

impl Cond {
    fn from_expr(expr: sql_ast::Expr, binder: &mut Binder<'_>) -> Result<Cond, StorageError> {
        use sql_ast::{BinaryOperator as B, Expr};
        Ok(match expr {
            Expr::Nested(inner) => Cond::from_expr(*inner, binder)?,
            Expr::BinaryOp { left, op: B::And, right } => Cond::And(
                Box::new(Cond::from_expr(*left, binder)?),
                Box::new(Cond::from_expr(*right, binder)?),
            ),
            Expr::BinaryOp { left, op: B::Or, right } => Cond::Or(
                Box::new(Cond::from_expr(*left, binder)?),
                Box::new(Cond::from_expr(*right, binder)?),
            ),
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    B::Eq => CmpOp::Eq,
                    B::NotEq => CmpOp::NotEq,
                    B::Lt => CmpOp::Lt,
                    B::LtEq => CmpOp::LtEq,
                    B::Gt => CmpOp::Gt,
                    B::GtEq => CmpOp::GtEq,
                    other => return Err(StorageError::Unsupported(format!("operator {}", other))),
                };
                let left = binder.operand(*left)?;
                let right = binder.operand(*right)?;
                Cond::Compare { left, op, right }
            }
            Expr::Like { negated, expr, pattern, .. } | Expr::ILike { negated, expr, pattern, .. } => {
                let expr = binder.operand(*expr)?;
                let pattern = binder.operand(*pattern)?;
                let compiled = match &pattern {
                    Operand::Literal(v) if !v.is_null() => like_regex(&text(v)),
                    _ => None,
                };
                Cond::Like {
                    expr,
                    pattern,
                    compiled,
                    negated,
                }
            }
            Expr::InList { expr, list, negated } => {
                let expr = binder.operand(*expr)?;
                let list = list
                    .into_iter()
                    .map(|e| binder.operand(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Cond::InList { expr, list, negated }
            }
            Expr::IsNull(e) => Cond::IsNull {
                expr: binder.operand(*e)?,
                negated: false,
            },
            Expr::IsNotNull(e) => Cond::IsNull {
                expr: binder.operand(*e)?,
                negated: true,
            },
            Expr::UnaryOp {
                op: sql_ast::UnaryOperator::Not,
                expr,
            } => Cond::Not(Box::new(Cond::from_expr(*expr, binder)?)),
            Expr::Value(v) => match binder.value(&v.value)? {
                Value::Bool(b) => Cond::Const(b),
                other => Cond::Const(truthy(&other)),
            },
            other => return Err(StorageError::Unsupported(format!("predicate {}", other))),
        })
    }

    fn eval(&self, row: &Row) -> bool {
        match self {
            Cond::Const(b) => *b,
            Cond::Compare { left, op, right } => {
                let ord = compare(left.resolve(row), right.resolve(row));
                match (op, ord) {
                    (_, None) => false,
                    (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
                    (CmpOp::NotEq, Some(o)) => o != Ordering::Equal,
                    (CmpOp::Lt, Some(o)) => o == Ordering::Less,
                    (CmpOp::LtEq, Some(o)) => o != Ordering::Greater,
                    (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
                    (CmpOp::GtEq, Some(o)) => o != Ordering::Less,
                }
            }
            Cond::Like {
                expr,
                pattern,
                compiled,
                negated,
            } => {
                let value = expr.resolve(row);
                if value.is_null() {
                    return false;
                }
                let matched = match compiled {
                    Some(re) => re.is_match(&text(value)),
                    None => {
                        let pattern = pattern.resolve(row);
                        if pattern.is_null() {
                            return false;
                        }
                        like_matches(&text(value), &text(pattern))
                    }
                };
                matched != *negated
            }
            Cond::InList { expr, list, negated } => {
                let value = expr.resolve(row);
                if value.is_null() {
                    return false;
                }
                let found = list
                    .iter()
                    .any(|o| compare(value, o.resolve(row)) == Some(Ordering::Equal));
                found != *negated
            }
            Cond::IsNull { expr, negated } => expr.resolve(row).is_null() != *negated,
            Cond::And(a, b) => a.eval(row) && b.eval(row),
            Cond::Or(a, b) => a.eval(row) || b.eval(row),
            Cond::Not(c) => !c.eval(row),
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// SQL-style comparison. `None` when either side is NULL.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(_), _) | (_, Value::Number(_)) | (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => Some(text(a).cmp(&text(b))),
            }
        }
        _ => Some(text(a).cmp(&text(b))),
    }
}

pub(crate) fn like_matches(value: &str, pattern: &str) -> bool {
    like_regex(pattern).is_some_and(|re| re.is_match(value))
}

/// Case-insensitive regex equivalent of a LIKE pattern.
fn like_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("(?is)^");
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

enum Projection {
    All,
    Columns(Vec<(String, String)>),
    Count(String),
}

struct SelectPlan {
    table: String,
    projection: Projection,
    filter: Option<Cond>,
    order: Vec<(String, bool)>,
    limit: Option<usize>,
    offset: usize,
}

impl SelectPlan {
    fn from_query(query: sql_ast::Query, binder: &mut Binder<'_>) -> Result<Self, StorageError> {
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(StorageError::Unsupported("only plain SELECT".into()));
        };
        let select = *select;
        if select.from.len() != 1 || !select.from[0].joins.is_empty() {
            return Err(StorageError::Unsupported("SELECT must read exactly one table".into()));
        }
        let table = table_factor_name(&select.from[0].relation)?;

        let mut projection = Projection::All;
        let mut columns = Vec::new();
        for item in select.projection {
            match item {
                sql_ast::SelectItem::Wildcard(_) => projection = Projection::All,
                sql_ast::SelectItem::UnnamedExpr(expr) => match expr {
                    sql_ast::Expr::Function(f) if f.name.to_string().eq_ignore_ascii_case("count") => {
                        projection = Projection::Count("count".into());
                    }
                    other => {
                        let Operand::Column(c) = binder.operand(other)? else {
                            return Err(StorageError::Unsupported("literal projection".into()));
                        };
                        columns.push((c.clone(), c));
                    }
                },
                sql_ast::SelectItem::ExprWithAlias { expr, alias } => match expr {
                    sql_ast::Expr::Function(f) if f.name.to_string().eq_ignore_ascii_case("count") => {
                        projection = Projection::Count(alias.value);
                    }
                    other => {
                        let Operand::Column(c) = binder.operand(other)? else {
                            return Err(StorageError::Unsupported("literal projection".into()));
                        };
                        columns.push((c, alias.value));
                    }
                },
                other => return Err(StorageError::Unsupported(format!("projection {}", other))),
            }
        }
        if !columns.is_empty() {
            projection = Projection::Columns(columns);
        }

        let filter = select.selection.map(|e| Cond::from_expr(e, binder)).transpose()?;

        let mut order = Vec::new();
        if let Some(order_by) = query.order_by {
            let sql_ast::OrderByKind::Expressions(exprs) = order_by.kind else {
                return Err(StorageError::Unsupported("ORDER BY ALL".into()));
            };
            for o in exprs {
                let Operand::Column(c) = binder.operand(o.expr)? else {
                    return Err(StorageError::Unsupported("ORDER BY literal".into()));
                };
                order.push((c, o.options.asc.map(|asc| !asc).unwrap_or(false)));
            }
        }

        let (limit, offset) = match query.limit_clause {
            None => (None, 0),
            Some(sql_ast::LimitClause::LimitOffset { limit, offset, .. }) => {
                let limit = limit.map(|e| binder.literal(e)).transpose()?;
                let offset = offset.map(|o| binder.literal(o.value)).transpose()?;
                paging(limit, offset)?
            }
            Some(sql_ast::LimitClause::OffsetCommaLimit { offset, limit }) => {
                let offset = binder.literal(offset)?;
                let limit = binder.literal(limit)?;
                paging(Some(limit), Some(offset))?
            }
        };

        Ok(SelectPlan {
            table,
            projection,
            filter,
            order,
            limit,
            offset,
        })
    }

    fn run(self, table: &Table) -> Result<Vec<Row>, StorageError> {
        let mut rows: Vec<&Row> = table
            .rows
            .iter()
            .filter(|r| self.filter.as_ref().map(|c| c.eval(r)).unwrap_or(true))
            .collect();

        if let Projection::Count(alias) = &self.projection {
            let mut row = Row::new();
            row.insert(alias.clone(), Value::Number((rows.len() as u64).into()));
            return Ok(vec![row]);
        }

        if !self.order.is_empty() {
            rows.sort_by(|a, b| {
                for (col, desc) in &self.order {
                    let ord = order_values(a.get(col).unwrap_or(&Value::Null), b.get(col).unwrap_or(&Value::Null));
                    let ord = if *desc { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let page = rows
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX));
        Ok(match &self.projection {
            Projection::All | Projection::Count(_) => page.cloned().collect(),
            Projection::Columns(cols) => page
                .map(|r| {
                    cols.iter()
                        .map(|(c, alias)| (alias.clone(), r.get(c).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .collect(),
        })
    }
}

/// Total order for ORDER BY: NULLs first, then SQL comparison.
fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

fn paging(limit: Option<Value>, offset: Option<Value>) -> Result<(Option<usize>, usize), StorageError> {
    let count = |v: Value| -> Result<usize, StorageError> {
        v.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| StorageError::Parse(format!("LIMIT/OFFSET must be a non-negative integer, got {}", v)))
    };
    let limit = limit.map(count).transpose()?;
    let offset = offset.map(count).transpose()?.unwrap_or(0);
    Ok((limit, offset))
}
