//! System table DDL, the installation marker, and typed writers for definition rows.
//! JSON columns are stored as text so every adapter can hold them.

use crate::config::{
    EntityDefinition, FieldDefinition, PermissionDefinition, RlsDefinition, ViewDefinition, WorkflowDefinition,
};
use crate::error::EngineError;
use crate::sql::{Filter, Predicate, SelectOptions, SqlBuilder};
use crate::storage::{ColumnDefinition, ColumnType, StorageAdapter};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

pub const SYSTEM_ENTITIES: &str = "system_entities";
pub const SYSTEM_FIELDS: &str = "system_fields";
pub const SYSTEM_PERMISSIONS: &str = "system_permissions";
pub const SYSTEM_VIEWS: &str = "system_views";
pub const SYSTEM_WORKFLOWS: &str = "system_workflows";
pub const SYSTEM_RLS: &str = "system_rls";
pub const SYSTEM_SETTINGS: &str = "system_settings";

/// `system_settings` row written once bootstrap has created every system table.
pub const INSTALLED_KEY: &str = "installed";

fn text(name: &str) -> ColumnDefinition {
    ColumnDefinition::new(name, ColumnType::Text)
}

fn flag(name: &str) -> ColumnDefinition {
    ColumnDefinition::new(name, ColumnType::Boolean)
}

fn json(name: &str) -> ColumnDefinition {
    ColumnDefinition::new(name, ColumnType::Json)
}

fn id() -> ColumnDefinition {
    text("id").primary_key()
}

fn timestamps() -> [ColumnDefinition; 2] {
    [
        ColumnDefinition::new("created_at", ColumnType::Timestamp),
        ColumnDefinition::new("updated_at", ColumnType::Timestamp),
    ]
}

/// Every system table with its columns, in creation order.
pub fn system_tables() -> Vec<(&'static str, Vec<ColumnDefinition>)> {
    let with_timestamps = |mut cols: Vec<ColumnDefinition>| {
        cols.extend(timestamps());
        cols
    };
    vec![
        (
            SYSTEM_ENTITIES,
            with_timestamps(vec![
                id(),
                text("name").not_null(),
                text("table_name").not_null(),
                text("display_name"),
                text("description"),
                flag("is_active"),
                json("metadata"),
            ]),
        ),
        (
            SYSTEM_FIELDS,
            with_timestamps(vec![
                id(),
                text("entity_id").not_null(),
                text("name").not_null(),
                text("type").not_null(),
                flag("is_required"),
                flag("is_unique"),
                json("default_value"),
                json("validation_rules"),
                ColumnDefinition::new("order_index", ColumnType::Integer),
                flag("is_active"),
                text("reference_entity"),
            ]),
        ),
        (
            SYSTEM_PERMISSIONS,
            with_timestamps(vec![
                id(),
                text("entity_id").not_null(),
                text("role").not_null(),
                text("action").not_null(),
                flag("is_allowed"),
                json("conditions"),
                json("field_permissions"),
                flag("is_active"),
            ]),
        ),
        (
            SYSTEM_VIEWS,
            with_timestamps(vec![
                id(),
                text("entity_id").not_null(),
                text("name").not_null(),
                json("query_config"),
                json("fields"),
                flag("is_default"),
                flag("is_public"),
            ]),
        ),
        (
            SYSTEM_WORKFLOWS,
            with_timestamps(vec![
                id(),
                text("entity_id").not_null(),
                text("name").not_null(),
                text("trigger_event").not_null(),
                json("conditions"),
                json("actions"),
                ColumnDefinition::new("order_index", ColumnType::Integer),
                flag("is_active"),
            ]),
        ),
        (
            SYSTEM_RLS,
            with_timestamps(vec![
                id(),
                text("entity_id").not_null(),
                text("role").not_null(),
                json("rls_config"),
                flag("is_active"),
            ]),
        ),
        (SYSTEM_SETTINGS, vec![id(), json("value"), ColumnDefinition::new("updated_at", ColumnType::Timestamp)]),
    ]
}

/// Create missing system tables and write the installation marker. Safe to call repeatedly.
/// Returns true when this call performed the installation.
pub async fn ensure_system_tables(storage: &dyn StorageAdapter, builder: &SqlBuilder) -> Result<bool, EngineError> {
    for (table, columns) in system_tables() {
        let exists = storage
            .table_exists(table)
            .await
            .map_err(|e| EngineError::storage("table_exists", e))?;
        if !exists {
            storage
                .create_table(table, &columns)
                .await
                .map_err(|e| EngineError::storage("create_table", e))?;
            tracing::debug!(table = %table, "created system table");
        }
    }
    if is_installed(storage, builder).await? {
        return Ok(false);
    }
    let marker = serde_json::json!({
        "installed_at": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    let mut row = Map::new();
    row.insert("id".into(), Value::String(INSTALLED_KEY.into()));
    row.insert("value".into(), Value::String(marker.to_string()));
    row.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
    insert_row(storage, builder, SYSTEM_SETTINGS, row).await?;
    tracing::info!("system tables installed");
    Ok(true)
}

/// Whether the installation marker is present. A missing settings table means not installed.
pub async fn is_installed(storage: &dyn StorageAdapter, builder: &SqlBuilder) -> Result<bool, EngineError> {
    let exists = storage
        .table_exists(SYSTEM_SETTINGS)
        .await
        .map_err(|e| EngineError::storage("table_exists", e))?;
    if !exists {
        return Ok(false);
    }
    let q = builder.count(
        SYSTEM_SETTINGS,
        &builder.tenants().default_tenant,
        &[Predicate::from(Filter::eq("id", INSTALLED_KEY))],
    )?;
    let rows = storage
        .query(&q.sql, &q.params)
        .await
        .map_err(|e| EngineError::storage("is_installed", e))?;
    Ok(rows
        .first()
        .and_then(|r| r.get("count"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
        > 0)
}

/// Read one `system_settings` value, decoded from JSON text.
pub async fn read_setting(storage: &dyn StorageAdapter, builder: &SqlBuilder, key: &str) -> Result<Option<Value>, EngineError> {
    let q = builder.select(
        SYSTEM_SETTINGS,
        &builder.tenants().default_tenant,
        &[Predicate::from(Filter::eq("id", key))],
        &SelectOptions::default(),
    )?;
    let rows = storage
        .query(&q.sql, &q.params)
        .await
        .map_err(|e| EngineError::storage("read_setting", e))?;
    Ok(rows
        .first()
        .map(|r| crate::config::decode_value(r, "value").unwrap_or(Value::Null)))
}

async fn insert_row(
    storage: &dyn StorageAdapter,
    builder: &SqlBuilder,
    table: &str,
    row: Map<String, Value>,
) -> Result<(), EngineError> {
    let q = builder.insert(table, &builder.tenants().default_tenant, &row)?;
    storage
        .execute(&q.sql, &q.params)
        .await
        .map_err(|e| EngineError::storage(format!("insert {}", table), e))?;
    Ok(())
}

fn json_text<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_string(value)
        .map(Value::String)
        .map_err(|e| EngineError::QueryBuild(format!("encode json column: {}", e)))
}

fn opt_text(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

/// Base row with id, entity id and both timestamps set to now.
fn definition_row(id: &str, entity_id: &str) -> Map<String, Value> {
    let now = Value::String(Utc::now().to_rfc3339());
    let mut row = Map::new();
    row.insert("id".into(), Value::String(id.to_string()));
    row.insert("entity_id".into(), Value::String(entity_id.to_string()));
    row.insert("created_at".into(), now.clone());
    row.insert("updated_at".into(), now);
    row
}

pub async fn insert_entity(
    storage: &dyn StorageAdapter,
    builder: &SqlBuilder,
    def: &EntityDefinition,
) -> Result<(), EngineError> {
    let now = Utc::now().to_rfc3339();
    let mut row = Map::new();
    row.insert("id".into(), Value::String(def.id.clone()));
    row.insert("name".into(), Value::String(def.name.clone()));
    row.insert("table_name".into(), Value::String(def.table_name.clone()));
    row.insert("display_name".into(), opt_text(&def.display_name));
    row.insert("description".into(), opt_text(&def.description));
    row.insert("is_active".into(), Value::Bool(def.is_active));
    row.insert("metadata".into(), json_text(&def.metadata)?);
    row.insert("created_at".into(), Value::String(def.created_at.clone().unwrap_or_else(|| now.clone())));
    row.insert("updated_at".into(), Value::String(def.updated_at.clone().unwrap_or(now)));
    insert_row(storage, builder, SYSTEM_ENTITIES, row).await
}

pub async fn insert_field(storage: &dyn StorageAdapter, builder: &SqlBuilder, def: &FieldDefinition) -> Result<(), EngineError> {
    let mut row = definition_row(&def.id, &def.entity_id);
    row.insert("name".into(), Value::String(def.name.clone()));
    row.insert("type".into(), Value::String(def.field_type.as_str().into()));
    row.insert("is_required".into(), Value::Bool(def.is_required));
    row.insert("is_unique".into(), Value::Bool(def.is_unique));
    row.insert(
        "default_value".into(),
        match &def.default_value {
            Some(v) => json_text(v)?,
            None => Value::Null,
        },
    );
    row.insert("validation_rules".into(), json_text(&def.validation_rules)?);
    row.insert("order_index".into(), Value::from(def.order_index));
    row.insert("is_active".into(), Value::Bool(def.is_active));
    row.insert("reference_entity".into(), opt_text(&def.reference_entity));
    insert_row(storage, builder, SYSTEM_FIELDS, row).await
}

pub async fn insert_permission(
    storage: &dyn StorageAdapter,
    builder: &SqlBuilder,
    def: &PermissionDefinition,
) -> Result<(), EngineError> {
    let mut row = definition_row(&def.id, &def.entity_id);
    row.insert("role".into(), Value::String(def.role.clone()));
    row.insert("action".into(), Value::String(def.action.as_str().into()));
    row.insert("is_allowed".into(), Value::Bool(def.is_allowed));
    row.insert("conditions".into(), json_text(&def.conditions)?);
    row.insert("field_permissions".into(), json_text(&def.field_permissions)?);
    row.insert("is_active".into(), Value::Bool(def.is_active));
    insert_row(storage, builder, SYSTEM_PERMISSIONS, row).await
}

pub async fn insert_view(storage: &dyn StorageAdapter, builder: &SqlBuilder, def: &ViewDefinition) -> Result<(), EngineError> {
    let mut row = definition_row(&def.id, &def.entity_id);
    row.insert("name".into(), Value::String(def.name.clone()));
    row.insert("query_config".into(), json_text(&def.query_config)?);
    row.insert("fields".into(), json_text(&def.fields)?);
    row.insert("is_default".into(), Value::Bool(def.is_default));
    row.insert("is_public".into(), Value::Bool(def.is_public));
    insert_row(storage, builder, SYSTEM_VIEWS, row).await
}

pub async fn insert_workflow(
    storage: &dyn StorageAdapter,
    builder: &SqlBuilder,
    def: &WorkflowDefinition,
) -> Result<(), EngineError> {
    let mut row = definition_row(&def.id, &def.entity_id);
    row.insert("name".into(), Value::String(def.name.clone()));
    row.insert("trigger_event".into(), Value::String(def.trigger_event.as_str().into()));
    row.insert("conditions".into(), json_text(&def.conditions)?);
    row.insert("actions".into(), json_text(&def.actions)?);
    row.insert("order_index".into(), Value::from(def.order_index));
    row.insert("is_active".into(), Value::Bool(def.is_active));
    insert_row(storage, builder, SYSTEM_WORKFLOWS, row).await
}

pub async fn insert_rls(storage: &dyn StorageAdapter, builder: &SqlBuilder, def: &RlsDefinition) -> Result<(), EngineError> {
    let mut row = definition_row(&def.id, &def.entity_id);
    row.insert("role".into(), Value::String(def.role.clone()));
    row.insert("rls_config".into(), json_text(&def.rls_config)?);
    row.insert("is_active".into(), Value::Bool(def.is_active));
    insert_row(storage, builder, SYSTEM_RLS, row).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Action, FieldType};
    use crate::storage::MemoryStorage;

    async fn storage() -> MemoryStorage {
        let s = MemoryStorage::new();
        s.connect().await.unwrap();
        s
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let s = storage().await;
        let builder = SqlBuilder::default();
        assert!(!is_installed(&s, &builder).await.unwrap());
        assert!(ensure_system_tables(&s, &builder).await.unwrap());
        assert!(!ensure_system_tables(&s, &builder).await.unwrap());
        assert!(is_installed(&s, &builder).await.unwrap());
        for (table, _) in system_tables() {
            assert!(s.table_exists(table).await.unwrap(), "{table} missing");
        }
        let marker = read_setting(&s, &builder, INSTALLED_KEY).await.unwrap().unwrap();
        assert_eq!(marker["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn writers_store_json_columns_as_text() {
        let s = storage().await;
        let builder = SqlBuilder::default();
        ensure_system_tables(&s, &builder).await.unwrap();
        insert_entity(&s, &builder, &EntityDefinition::new("e1", "user", "users")).await.unwrap();
        insert_field(&s, &builder, &FieldDefinition::new("e1", "email", FieldType::String).required())
            .await
            .unwrap();
        insert_permission(&s, &builder, &PermissionDefinition::allow("e1", "admin", Action::Create))
            .await
            .unwrap();

        let rows = s.query(r#"SELECT * FROM "system_fields""#, &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["type"], "string");
        assert_eq!(rows[0]["is_required"], true);
        assert!(rows[0]["validation_rules"].is_string());

        let rows = s.query(r#"SELECT * FROM "system_permissions""#, &[]).await.unwrap();
        assert_eq!(rows[0]["action"], "create");
        assert_eq!(rows[0]["field_permissions"], "{}");
    }
}
