//! PostgreSQL storage adapter on a sqlx pool. Rows are decoded into JSON maps.

use crate::error::StorageError;
use crate::sql::{Dialect, PgBindValue, SqlBuilder};
use crate::storage::{ColumnDefinition, ColumnType, ExecuteResult, Row, StorageAdapter};
use crate::tenant::TenantScope;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

pub struct PgStorage {
    url: String,
    max_connections: u32,
    pool: RwLock<Option<PgPool>>,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
    in_tx: AtomicBool,
}

impl PgStorage {
    pub fn new(url: impl Into<String>) -> Self {
        PgStorage {
            url: url.into(),
            max_connections: 5,
            pool: RwLock::new(None),
            tx: Mutex::new(None),
            in_tx: AtomicBool::new(false),
        }
    }

    /// Wrap an existing pool; the adapter starts connected.
    pub fn from_pool(pool: PgPool) -> Self {
        PgStorage {
            url: String::new(),
            max_connections: 5,
            pool: RwLock::new(Some(pool)),
            tx: Mutex::new(None),
            in_tx: AtomicBool::new(false),
        }
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    async fn pool(&self) -> Result<PgPool, StorageError> {
        self.pool.read().await.clone().ok_or(StorageError::NotConnected)
    }

    fn bind<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
        params
            .iter()
            .fold(sqlx::query(sql), |q, p| q.bind(PgBindValue::from_json(p)))
    }

    async fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<PgRow>, StorageError> {
        let mut tx = self.tx.lock().await;
        let rows = match tx.as_mut() {
            Some(tx) => Self::bind(sql, params).fetch_all(&mut **tx).await?,
            None => Self::bind(sql, params).fetch_all(&self.pool().await?).await?,
        };
        Ok(rows)
    }
}

#[async_trait]
impl StorageAdapter for PgStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        let mut pool = self.pool.write().await;
        if pool.is_none() {
            let p = PgPoolOptions::new()
                .max_connections(self.max_connections)
                .connect(&self.url)
                .await?;
            tracing::info!(max_connections = self.max_connections, "postgres pool connected");
            *pool = Some(p);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        if let Some(p) = self.pool.write().await.take() {
            p.close().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool
            .try_read()
            .map(|p| p.as_ref().map(|p| !p.is_closed()).unwrap_or(false))
            .unwrap_or(false)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        tracing::debug!(sql = %sql, params = ?params, "query");
        let rows = self.fetch(sql, params).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult, StorageError> {
        tracing::debug!(sql = %sql, params = ?params, "execute");
        let mut tx = self.tx.lock().await;
        let done = match tx.as_mut() {
            Some(tx) => Self::bind(sql, params).execute(&mut **tx).await?,
            None => Self::bind(sql, params).execute(&self.pool().await?).await?,
        };
        Ok(ExecuteResult {
            changes: done.rows_affected(),
            last_insert_id: None,
        })
    }

    async fn begin(&self) -> Result<(), StorageError> {
        let mut tx = self.tx.lock().await;
        if tx.is_some() {
            return Err(StorageError::Transaction("transaction already open".into()));
        }
        *tx = Some(self.pool().await?.begin().await?);
        self.in_tx.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), StorageError> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| StorageError::Transaction("no open transaction".into()))?;
        self.in_tx.store(false, Ordering::SeqCst);
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StorageError> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| StorageError::Transaction("no open transaction".into()))?;
        self.in_tx.store(false, Ordering::SeqCst);
        tx.rollback().await?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::SeqCst)
    }

    async fn table_exists(&self, name: &str) -> Result<bool, StorageError> {
        let rows = self
            .query(
                "SELECT to_regclass($1) IS NOT NULL AS present",
                &[Value::String(name.to_string())],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("present"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn create_table(&self, name: &str, columns: &[ColumnDefinition]) -> Result<(), StorageError> {
        let ddl = SqlBuilder::new(Dialect::Postgres, TenantScope::default())
            .create_table(name, columns)
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        self.execute(&ddl, &[]).await?;
        Ok(())
    }

    async fn get_table_columns(&self, name: &str) -> Result<Vec<ColumnDefinition>, StorageError> {
        let (schema, table) = match name.split_once('.') {
            Some((s, t)) => (s.to_string(), t.to_string()),
            None => ("public".to_string(), name.to_string()),
        };
        let sql = r#"
            SELECT c.column_name, c.data_type, c.is_nullable,
                   EXISTS (
                       SELECT 1 FROM information_schema.table_constraints tc
                       JOIN information_schema.key_column_usage k
                         ON k.constraint_name = tc.constraint_name AND k.table_schema = tc.table_schema
                       WHERE tc.constraint_type = 'PRIMARY KEY'
                         AND tc.table_schema = c.table_schema AND tc.table_name = c.table_name
                         AND k.column_name = c.column_name
                   ) AS is_primary
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;
        let rows = self.query(sql, &[Value::String(schema), Value::String(table)]).await?;
        if rows.is_empty() {
            return Err(StorageError::TableNotFound(name.to_string()));
        }
        Ok(rows
            .iter()
            .map(|r| {
                let text = |k: &str| r.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
                ColumnDefinition {
                    name: text("column_name"),
                    column_type: pg_column_type(&text("data_type")),
                    nullable: text("is_nullable") == "YES",
                    primary_key: r.get("is_primary").and_then(Value::as_bool).unwrap_or(false),
                }
            })
            .collect())
    }
}

fn pg_column_type(data_type: &str) -> ColumnType {
    match data_type.to_lowercase().as_str() {
        "smallint" | "integer" | "bigint" => ColumnType::Integer,
        "real" | "double precision" | "numeric" => ColumnType::Real,
        "boolean" => ColumnType::Boolean,
        "json" | "jsonb" => ColumnType::Json,
        t if t.starts_with("timestamp") => ColumnType::Timestamp,
        _ => ColumnType::Text,
    }
}

fn row_to_json(row: &PgRow) -> Row {
    use sqlx::Column;
    use sqlx::Row as _;
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell_to_value(row, col.name())))
        .collect()
}

/// Decode one cell by trying the common column types in turn.
fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row as _;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_information_schema_types() {
        assert_eq!(pg_column_type("bigint"), ColumnType::Integer);
        assert_eq!(pg_column_type("double precision"), ColumnType::Real);
        assert_eq!(pg_column_type("timestamp with time zone"), ColumnType::Timestamp);
        assert_eq!(pg_column_type("jsonb"), ColumnType::Json);
        assert_eq!(pg_column_type("text"), ColumnType::Text);
    }

    #[tokio::test]
    async fn unconnected_adapter_reports_not_connected() {
        let pg = PgStorage::new("postgres://localhost/unused");
        assert!(!pg.is_connected());
        assert!(matches!(pg.query("SELECT 1", &[]).await, Err(StorageError::NotConnected)));
    }
}
