//! Storage adapter contract and the shipped adapters.

mod memory;
mod postgres;

pub(crate) use memory::{compare as compare_values, like_matches};
pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use crate::error::{EngineError, StorageError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// RFC 3339 text.
    Timestamp,
    /// JSON encoded as text.
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnDefinition {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExecuteResult {
    pub changes: u64,
    pub last_insert_id: Option<Value>,
}

/// Uniform interface over a backing store. Parameters are positional and bound in order.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;
    async fn disconnect(&self) -> Result<(), StorageError>;
    fn is_connected(&self) -> bool;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError>;
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult, StorageError>;

    async fn begin(&self) -> Result<(), StorageError>;
    async fn commit(&self) -> Result<(), StorageError>;
    async fn rollback(&self) -> Result<(), StorageError>;
    fn in_transaction(&self) -> bool;

    async fn table_exists(&self, name: &str) -> Result<bool, StorageError>;
    async fn create_table(&self, name: &str, columns: &[ColumnDefinition]) -> Result<(), StorageError>;
    async fn get_table_columns(&self, name: &str) -> Result<Vec<ColumnDefinition>, StorageError>;
}

/// Run `f` inside a transaction: commit on success, roll back on error.
/// When `adapter` is already in a transaction, `f` runs inline without a nested BEGIN.
pub async fn transaction<T, F>(adapter: &dyn StorageAdapter, f: F) -> Result<T, EngineError>
where
    T: Send,
    F: for<'a> FnOnce(&'a dyn StorageAdapter) -> BoxFuture<'a, Result<T, EngineError>>,
{
    if adapter.in_transaction() {
        return f(adapter).await;
    }
    adapter.begin().await.map_err(|e| EngineError::storage("begin", e))?;
    match f(adapter).await {
        Ok(value) => {
            adapter.commit().await.map_err(|e| EngineError::storage("commit", e))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = adapter.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
