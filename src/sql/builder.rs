//! Builds parameterized SELECT, INSERT, UPDATE, DELETE, COUNT and CREATE TABLE statements.
//!
//! Identifiers are validated and quoted per dialect; values are always bound as parameters.
//! All predicates (tenant, caller, view, RLS) are collected first and the WHERE clause is
//! rendered once from the complete list.

use crate::error::EngineError;
use crate::sql::filter::{Filter, Operator, Predicate, SortDirection, SortSpec};
use crate::storage::{ColumnDefinition, ColumnType};
use crate::tenant::TenantScope;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Placeholder and quoting style of the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `?` placeholders, double-quoted identifiers.
    Generic,
    /// Same surface as generic.
    Sqlite,
    /// `?` placeholders, backtick-quoted identifiers.
    MySql,
    /// `$1, $2, ...` placeholders, double-quoted identifiers.
    Postgres,
}

impl Dialect {
    fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Generic | Dialect::Sqlite | Dialect::MySql => "?".to_string(),
        }
    }

    fn quote_char(self) -> char {
        match self {
            Dialect::MySql => '`',
            Dialect::Generic | Dialect::Sqlite | Dialect::Postgres => '"',
        }
    }

    fn column_type(self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (_, ColumnType::Text) | (_, ColumnType::Json) | (_, ColumnType::Timestamp) => "TEXT",
            (Dialect::Postgres, ColumnType::Integer) | (Dialect::MySql, ColumnType::Integer) => "BIGINT",
            (_, ColumnType::Integer) => "INTEGER",
            (Dialect::Postgres, ColumnType::Real) | (Dialect::MySql, ColumnType::Real) => "DOUBLE PRECISION",
            (_, ColumnType::Real) => "REAL",
            (_, ColumnType::Boolean) => "BOOLEAN",
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(Dialect::Generic),
            "sqlite" => Ok(Dialect::Sqlite),
            "mysql" => Ok(Dialect::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            other => Err(format!("unknown dialect: {}", other)),
        }
    }
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("identifier pattern is valid")
    })
}

/// Letters, digits and underscores, optionally schema-qualified with one dot.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_re().is_match(name)
}

/// Statement text plus positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }
}

/// Projection, ordering and paging for SELECT.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectOptions {
    /// Columns to project; `None` selects `*`.
    pub fields: Option<Vec<String>>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Pure statement builder for one dialect and tenant configuration.
#[derive(Clone, Debug)]
pub struct SqlBuilder {
    dialect: Dialect,
    tenants: TenantScope,
}

/// Placeholder allocator bound to one statement.
struct Binder<'a> {
    dialect: Dialect,
    q: &'a mut QueryBuf,
}

impl Binder<'_> {
    fn bind(&mut self, v: Value) -> String {
        self.q.params.push(v);
        self.dialect.placeholder(self.q.params.len())
    }
}

impl SqlBuilder {
    pub fn new(dialect: Dialect, tenants: TenantScope) -> Self {
        SqlBuilder { dialect, tenants }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn tenants(&self) -> &TenantScope {
        &self.tenants
    }

    /// Validate and quote an identifier; each dotted part is quoted separately.
    pub fn quote_identifier(&self, name: &str) -> Result<String, EngineError> {
        if !is_valid_identifier(name) {
            return Err(EngineError::QueryBuild(format!("invalid identifier '{}'", name)));
        }
        let q = self.dialect.quote_char();
        Ok(name
            .split('.')
            .map(|part| format!("{q}{part}{q}"))
            .collect::<Vec<_>>()
            .join("."))
    }

    fn table(&self, table: &str, tenant: &str) -> Result<String, EngineError> {
        let physical = self.tenants.physical_table(table, tenant)?;
        self.quote_identifier(&physical)
    }

    /// `SELECT * FROM t [WHERE tenant AND predicates] [ORDER BY] [LIMIT] [OFFSET]`.
    pub fn select(
        &self,
        table: &str,
        tenant: &str,
        predicates: &[Predicate],
        options: &SelectOptions,
    ) -> Result<QueryBuf, EngineError> {
        let mut q = QueryBuf::new();
        let table = self.table(table, tenant)?;
        let cols = match &options.fields {
            Some(fields) if !fields.is_empty() => fields
                .iter()
                .map(|f| self.quote_identifier(f))
                .collect::<Result<Vec<_>, _>>()?
                .join(", "),
            _ => "*".to_string(),
        };
        let where_clause = self.where_clause(&mut q, Vec::new(), tenant, predicates)?;
        let order_clause = self.order_clause(&options.sort)?;
        let limit_clause = options.limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
        let offset_clause = options.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
        q.sql = format!(
            "SELECT {} FROM {}{}{}{}{}",
            cols, table, where_clause, order_clause, limit_clause, offset_clause
        );
        Ok(q)
    }

    /// `SELECT COUNT(*) AS count FROM t [WHERE ...]`.
    pub fn count(&self, table: &str, tenant: &str, predicates: &[Predicate]) -> Result<QueryBuf, EngineError> {
        let mut q = QueryBuf::new();
        let table = self.table(table, tenant)?;
        let where_clause = self.where_clause(&mut q, Vec::new(), tenant, predicates)?;
        q.sql = format!("SELECT COUNT(*) AS count FROM {}{}", table, where_clause);
        Ok(q)
    }

    /// `INSERT INTO t (cols) VALUES (?, ...)`. Columns are emitted in sorted order.
    /// With column isolation and a non-default tenant the tenant column is stamped when absent.
    pub fn insert(&self, table: &str, tenant: &str, data: &Map<String, Value>) -> Result<QueryBuf, EngineError> {
        let mut q = QueryBuf::new();
        let table = self.table(table, tenant)?;
        let mut row = data.clone();
        if let Some(f) = self.tenants.tenant_filter(tenant) {
            row.entry(f.field).or_insert(f.value);
        }
        if row.is_empty() {
            return Err(EngineError::QueryBuild("insert requires at least one column".into()));
        }
        let mut cols = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        let mut binder = Binder { dialect: self.dialect, q: &mut q };
        let mut keys: Vec<&String> = row.keys().collect();
        keys.sort();
        for k in keys {
            cols.push(self.quote_identifier(k)?);
            placeholders.push(binder.bind(row[k.as_str()].clone()));
        }
        q.sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            cols.join(", "),
            placeholders.join(", ")
        );
        Ok(q)
    }

    /// `UPDATE t SET c = ?, ... WHERE id = ? [AND tenant] [AND predicates]`.
    /// The id and tenant columns are never assigned.
    pub fn update(
        &self,
        table: &str,
        tenant: &str,
        id: &Value,
        data: &Map<String, Value>,
        predicates: &[Predicate],
    ) -> Result<QueryBuf, EngineError> {
        let mut q = QueryBuf::new();
        let table = self.table(table, tenant)?;
        let mut keys: Vec<&String> = data
            .keys()
            .filter(|k| k.as_str() != "id" && **k != self.tenants.column)
            .collect();
        keys.sort();
        if keys.is_empty() {
            return Err(EngineError::QueryBuild("update requires at least one column".into()));
        }
        let mut sets = Vec::with_capacity(keys.len());
        {
            let mut binder = Binder { dialect: self.dialect, q: &mut q };
            for k in keys {
                let col = self.quote_identifier(k)?;
                sets.push(format!("{} = {}", col, binder.bind(data[k.as_str()].clone())));
            }
        }
        let id_clause = self.id_clause(&mut q, id)?;
        let where_clause = self.where_clause(&mut q, vec![id_clause], tenant, predicates)?;
        q.sql = format!("UPDATE {} SET {}{}", table, sets.join(", "), where_clause);
        Ok(q)
    }

    /// `DELETE FROM t WHERE id = ? [AND tenant] [AND predicates]`.
    pub fn delete(&self, table: &str, tenant: &str, id: &Value, predicates: &[Predicate]) -> Result<QueryBuf, EngineError> {
        let mut q = QueryBuf::new();
        let table = self.table(table, tenant)?;
        let id_clause = self.id_clause(&mut q, id)?;
        let where_clause = self.where_clause(&mut q, vec![id_clause], tenant, predicates)?;
        q.sql = format!("DELETE FROM {}{}", table, where_clause);
        Ok(q)
    }

    /// `CREATE TABLE IF NOT EXISTS t (...)` for the dialect.
    pub fn create_table(&self, table: &str, columns: &[ColumnDefinition]) -> Result<String, EngineError> {
        if columns.is_empty() {
            return Err(EngineError::QueryBuild("create table requires at least one column".into()));
        }
        let mut defs = Vec::with_capacity(columns.len());
        for c in columns {
            let mut def = format!("{} {}", self.quote_identifier(&c.name)?, self.dialect.column_type(c.column_type));
            if c.primary_key {
                def.push_str(" PRIMARY KEY");
            } else if !c.nullable {
                def.push_str(" NOT NULL");
            }
            defs.push(def);
        }
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote_identifier(table)?,
            defs.join(", ")
        ))
    }

    fn id_clause(&self, q: &mut QueryBuf, id: &Value) -> Result<String, EngineError> {
        let col = self.quote_identifier("id")?;
        let mut binder = Binder { dialect: self.dialect, q };
        Ok(format!("{} = {}", col, binder.bind(id.clone())))
    }

    /// Render `leading` clauses, then the tenant predicate, then `predicates`, joined by AND.
    fn where_clause(
        &self,
        q: &mut QueryBuf,
        mut parts: Vec<String>,
        tenant: &str,
        predicates: &[Predicate],
    ) -> Result<String, EngineError> {
        if let Some(f) = self.tenants.tenant_filter(tenant) {
            parts.push(self.render_filter(q, &f)?);
        }
        for p in predicates {
            parts.push(self.render_predicate(q, p)?);
        }
        if parts.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" WHERE {}", parts.join(" AND ")))
        }
    }

    fn order_clause(&self, sort: &[SortSpec]) -> Result<String, EngineError> {
        if sort.is_empty() {
            return Ok(String::new());
        }
        let mut clauses = Vec::with_capacity(sort.len());
        for s in sort {
            let col = self.quote_identifier(&s.field)?;
            clauses.push(match s.direction {
                SortDirection::Asc => format!("{col} ASC"),
                SortDirection::Desc => format!("{col} DESC"),
            });
        }
        Ok(format!(" ORDER BY {}", clauses.join(", ")))
    }

    /// Render one predicate. Empty groups impose no restriction.
    pub(crate) fn render_predicate(&self, q: &mut QueryBuf, p: &Predicate) -> Result<String, EngineError> {
        match p {
            Predicate::Constant(true) => Ok("1=1".into()),
            Predicate::Constant(false) => Ok("1=0".into()),
            Predicate::Filter(f) => self.render_filter(q, f),
            Predicate::Group { relation, predicates } => {
                if predicates.is_empty() {
                    return Ok("1=1".into());
                }
                let mut rendered = Vec::with_capacity(predicates.len());
                for inner in predicates {
                    rendered.push(self.render_predicate(q, inner)?);
                }
                if rendered.len() == 1 {
                    return Ok(rendered.remove(0));
                }
                Ok(format!("({})", rendered.join(&format!(" {} ", relation.keyword()))))
            }
        }
    }

    fn render_filter(&self, q: &mut QueryBuf, f: &Filter) -> Result<String, EngineError> {
        let col = self.quote_identifier(&f.field)?;
        let mut binder = Binder { dialect: self.dialect, q };
        let sql = match f.operator {
            Operator::Eq if f.value.is_null() => format!("{col} IS NULL"),
            Operator::Neq if f.value.is_null() => format!("{col} IS NOT NULL"),
            Operator::Eq => format!("{col} = {}", binder.bind(f.value.clone())),
            Operator::Neq => format!("{col} <> {}", binder.bind(f.value.clone())),
            Operator::Gt => format!("{col} > {}", binder.bind(f.value.clone())),
            Operator::Gte => format!("{col} >= {}", binder.bind(f.value.clone())),
            Operator::Lt => format!("{col} < {}", binder.bind(f.value.clone())),
            Operator::Lte => format!("{col} <= {}", binder.bind(f.value.clone())),
            Operator::Like => format!("{col} LIKE {}", binder.bind(f.value.clone())),
            Operator::Contains => {
                let pattern = format!("%{}%", like_text(&f.value));
                format!("{col} LIKE {}", binder.bind(Value::String(pattern)))
            }
            Operator::StartsWith => {
                let pattern = format!("{}%", like_text(&f.value));
                format!("{col} LIKE {}", binder.bind(Value::String(pattern)))
            }
            Operator::EndsWith => {
                let pattern = format!("%{}", like_text(&f.value));
                format!("{col} LIKE {}", binder.bind(Value::String(pattern)))
            }
            Operator::In | Operator::Nin => {
                let values = match &f.value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let negated = f.operator == Operator::Nin;
                if values.is_empty() {
                    return Ok(if negated { "1=1".into() } else { "1=0".into() });
                }
                let placeholders: Vec<String> = values.into_iter().map(|v| binder.bind(v)).collect();
                let kw = if negated { "NOT IN" } else { "IN" };
                format!("{col} {kw} ({})", placeholders.join(", "))
            }
        };
        Ok(sql)
    }
}

impl Default for SqlBuilder {
    fn default() -> Self {
        SqlBuilder::new(Dialect::Generic, TenantScope::default())
    }
}

fn like_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantIsolation;
    use serde_json::json;

    fn builder() -> SqlBuilder {
        SqlBuilder::default()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn select_with_single_filter_binds_one_param() {
        let q = builder()
            .select(
                "users",
                "default",
                &[Filter::new("age", Operator::Gte, 18).into()],
                &SelectOptions::default(),
            )
            .unwrap();
        assert_eq!(q.sql, r#"SELECT * FROM "users" WHERE "age" >= ?"#);
        assert_eq!(q.sql.matches('?').count(), 1);
        assert_eq!(q.params, vec![json!(18)]);
    }

    #[test]
    fn empty_in_short_circuits() {
        let q = builder()
            .select(
                "users",
                "default",
                &[Filter::new("role", Operator::In, json!([])).into()],
                &SelectOptions::default(),
            )
            .unwrap();
        assert!(!q.sql.contains("IN ()"));
        assert!(q.sql.ends_with("WHERE 1=0"));
        assert!(q.params.is_empty());

        let q = builder()
            .select(
                "users",
                "default",
                &[Filter::new("role", Operator::Nin, json!([])).into()],
                &SelectOptions::default(),
            )
            .unwrap();
        assert!(q.sql.ends_with("WHERE 1=1"));
    }

    #[test]
    fn in_expands_one_placeholder_per_element() {
        let q = builder()
            .select(
                "users",
                "default",
                &[Filter::new("role", Operator::Nin, json!(["a", "b", "c"])).into()],
                &SelectOptions::default(),
            )
            .unwrap();
        assert_eq!(q.sql, r#"SELECT * FROM "users" WHERE "role" NOT IN (?, ?, ?)"#);
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn like_family_builds_patterns() {
        let q = builder()
            .select(
                "users",
                "default",
                &[
                    Filter::new("name", Operator::Contains, "an").into(),
                    Filter::new("name", Operator::StartsWith, "A").into(),
                    Filter::new("name", Operator::EndsWith, "n").into(),
                ],
                &SelectOptions::default(),
            )
            .unwrap();
        assert_eq!(q.params, vec![json!("%an%"), json!("A%"), json!("%n")]);
        assert_eq!(q.sql.matches("LIKE").count(), 3);
    }

    #[test]
    fn tenant_predicate_comes_first() {
        let q = builder()
            .select(
                "users",
                "acme",
                &[Filter::eq("status", "active").into()],
                &SelectOptions {
                    sort: vec![SortSpec::desc("created_at")],
                    limit: Some(10),
                    offset: Some(20),
                    ..SelectOptions::default()
                },
            )
            .unwrap();
        assert_eq!(
            q.sql,
            r#"SELECT * FROM "users" WHERE "tenant_id" = ? AND "status" = ? ORDER BY "created_at" DESC LIMIT 10 OFFSET 20"#
        );
        assert_eq!(q.params, vec![json!("acme"), json!("active")]);
    }

    #[test]
    fn postgres_placeholders_are_numbered() {
        let b = SqlBuilder::new(Dialect::Postgres, TenantScope::default());
        let q = b
            .update(
                "users",
                "acme",
                &json!("u1"),
                &obj(json!({ "name": "Ann", "age": 30 })),
                &[Filter::eq("owner_id", "u1").into()],
            )
            .unwrap();
        assert_eq!(
            q.sql,
            r#"UPDATE "users" SET "age" = $1, "name" = $2 WHERE "id" = $3 AND "tenant_id" = $4 AND "owner_id" = $5"#
        );
        assert_eq!(q.params, vec![json!(30), json!("Ann"), json!("u1"), json!("acme"), json!("u1")]);
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let err = builder()
            .select(
                "users",
                "default",
                &[Filter::eq("name; DROP TABLE users", "x").into()],
                &SelectOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::QueryBuild(_)));
        assert!(builder().count("users--", "default", &[]).is_err());
        assert!(builder().quote_identifier("app.users").is_ok());
        assert!(builder().quote_identifier("a.b.c").is_err());
    }

    #[test]
    fn or_groups_are_parenthesized() {
        let q = builder()
            .count(
                "docs",
                "default",
                &[
                    Filter::eq("archived", false).into(),
                    Predicate::any(vec![
                        Filter::eq("owner_id", "u1").into(),
                        Filter::eq("visibility", "public").into(),
                    ]),
                ],
            )
            .unwrap();
        assert_eq!(
            q.sql,
            r#"SELECT COUNT(*) AS count FROM "docs" WHERE "archived" = ? AND ("owner_id" = ? OR "visibility" = ?)"#
        );
    }

    #[test]
    fn insert_stamps_tenant_and_sorts_columns() {
        let q = builder()
            .insert("users", "acme", &obj(json!({ "name": "Ann", "id": "u1" })))
            .unwrap();
        assert_eq!(q.sql, r#"INSERT INTO "users" ("id", "name", "tenant_id") VALUES (?, ?, ?)"#);
        assert_eq!(q.params, vec![json!("u1"), json!("Ann"), json!("acme")]);
        assert!(builder().insert("users", "default", &Map::new()).is_err());
    }

    #[test]
    fn delete_and_null_equality() {
        let q = builder()
            .delete("users", "default", &json!("u1"), &[Filter::eq("deleted_at", Value::Null).into()])
            .unwrap();
        assert_eq!(q.sql, r#"DELETE FROM "users" WHERE "id" = ? AND "deleted_at" IS NULL"#);
        assert_eq!(q.params, vec![json!("u1")]);
    }

    #[test]
    fn mysql_quotes_with_backticks_and_prefix_tenants() {
        let b = SqlBuilder::new(
            Dialect::MySql,
            TenantScope::new(TenantIsolation::TablePrefix, "tenant_id", "default"),
        );
        let q = b.select("users", "acme", &[], &SelectOptions::default()).unwrap();
        assert_eq!(q.sql, "SELECT * FROM `acme_users`");
    }

    #[test]
    fn create_table_ddl() {
        let sql = builder()
            .create_table(
                "users",
                &[
                    ColumnDefinition::new("id", ColumnType::Text).primary_key(),
                    ColumnDefinition::new("age", ColumnType::Integer).not_null(),
                    ColumnDefinition::new("meta", ColumnType::Json),
                ],
            )
            .unwrap();
        assert_eq!(
            sql,
            r#"CREATE TABLE IF NOT EXISTS "users" ("id" TEXT PRIMARY KEY, "age" INTEGER NOT NULL, "meta" TEXT)"#
        );
    }
}
