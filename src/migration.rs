//! Create an entity's data table from its field definitions.

use crate::config::EntityConfiguration;
use crate::error::EngineError;
use crate::storage::{ColumnDefinition, ColumnType, StorageAdapter};
use crate::tenant::{TenantIsolation, TenantScope};
use std::collections::HashSet;

/// Columns the engine manages on every record.
pub const MANAGED_COLUMNS: [&str; 5] = ["id", "created_at", "updated_at", "created_by", "updated_by"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    /// Table already present; `missing` lists configured columns it lacks.
    Existing { missing: Vec<String> },
}

/// Column set for the entity's table: managed columns, the tenant column under column
/// isolation, then one column per stored field in field order.
pub fn entity_columns(config: &EntityConfiguration, scope: &TenantScope) -> Vec<ColumnDefinition> {
    let mut cols = vec![
        ColumnDefinition::new("id", ColumnType::Text).primary_key(),
        ColumnDefinition::new("created_at", ColumnType::Timestamp),
        ColumnDefinition::new("updated_at", ColumnType::Timestamp),
        ColumnDefinition::new("created_by", ColumnType::Text),
        ColumnDefinition::new("updated_by", ColumnType::Text),
    ];
    if scope.isolation == TenantIsolation::Column {
        cols.push(ColumnDefinition::new(scope.column.clone(), ColumnType::Text));
    }
    let mut seen: HashSet<String> = cols.iter().map(|c| c.name.clone()).collect();
    for field in config.stored_fields().filter(|f| f.is_active) {
        let Some(column_type) = field.field_type.column_type() else {
            continue;
        };
        if !seen.insert(field.name.clone()) {
            continue;
        }
        let col = ColumnDefinition::new(field.name.clone(), column_type);
        cols.push(if field.is_required { col.not_null() } else { col });
    }
    cols
}

/// Create the entity's table for `tenant` when absent. An existing table is left alone;
/// configured columns it lacks are reported.
pub async fn sync_entity_table(
    storage: &dyn StorageAdapter,
    config: &EntityConfiguration,
    scope: &TenantScope,
    tenant: &str,
) -> Result<SyncOutcome, EngineError> {
    let table = scope.physical_table(config.table_name(), tenant)?;
    let wanted = entity_columns(config, scope);
    let exists = storage
        .table_exists(&table)
        .await
        .map_err(|e| EngineError::storage("table_exists", e))?;
    if !exists {
        storage
            .create_table(&table, &wanted)
            .await
            .map_err(|e| EngineError::storage("create_table", e))?;
        tracing::info!(entity = %config.name(), table = %table, columns = wanted.len(), "created entity table");
        return Ok(SyncOutcome::Created);
    }
    let present: HashSet<String> = storage
        .get_table_columns(&table)
        .await
        .map_err(|e| EngineError::storage("get_table_columns", e))?
        .into_iter()
        .map(|c| c.name)
        .collect();
    let missing: Vec<String> = wanted
        .into_iter()
        .map(|c| c.name)
        .filter(|n| !present.contains(n))
        .collect();
    if !missing.is_empty() {
        tracing::warn!(entity = %config.name(), table = %table, missing = ?missing, "entity table lacks configured columns");
    }
    Ok(SyncOutcome::Existing { missing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntityDefinition, FieldDefinition, FieldType};
    use crate::storage::MemoryStorage;

    fn config() -> EntityConfiguration {
        let mut cfg = EntityConfiguration::new(EntityDefinition::new("e1", "user", "users"));
        cfg.fields = vec![
            FieldDefinition::new("e1", "email", FieldType::String).required(),
            FieldDefinition::new("e1", "profile", FieldType::Object),
            FieldDefinition::new("e1", "display", FieldType::Computed),
        ];
        cfg
    }

    #[test]
    fn columns_skip_computed_fields() {
        let names: Vec<String> = entity_columns(&config(), &TenantScope::default())
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            vec!["id", "created_at", "updated_at", "created_by", "updated_by", "tenant_id", "email", "profile"]
        );
    }

    #[tokio::test]
    async fn creates_once_then_reports_missing_columns() {
        let s = MemoryStorage::new();
        s.connect().await.unwrap();
        let scope = TenantScope::default();
        let mut cfg = config();
        assert_eq!(sync_entity_table(&s, &cfg, &scope, "default").await.unwrap(), SyncOutcome::Created);
        assert!(s.table_exists("users").await.unwrap());

        cfg.fields.push(FieldDefinition::new("e1", "age", FieldType::Integer));
        assert_eq!(
            sync_entity_table(&s, &cfg, &scope, "default").await.unwrap(),
            SyncOutcome::Existing { missing: vec!["age".into()] }
        );
    }

    #[tokio::test]
    async fn table_prefix_isolation_creates_per_tenant_tables() {
        let s = MemoryStorage::new();
        s.connect().await.unwrap();
        let scope = TenantScope::new(TenantIsolation::TablePrefix, "tenant_id", "default");
        sync_entity_table(&s, &config(), &scope, "acme").await.unwrap();
        assert!(s.table_exists("acme_users").await.unwrap());
        assert!(!s.table_exists("users").await.unwrap());
        let cols = s.get_table_columns("acme_users").await.unwrap();
        assert!(cols.iter().all(|c| c.name != "tenant_id"));
    }
}
