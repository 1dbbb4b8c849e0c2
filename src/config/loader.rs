//! Load an entity's configuration from the system tables and cache it per tenant and role set.

use crate::config::cache::{CacheKey, CacheStats, ConfigCache};
use crate::config::decode::{decode_or_default, decode_value, row_bool, row_i64, row_id, row_opt_str, row_str, Row};
use crate::config::types::*;
use crate::context::Context;
use crate::error::EngineError;
use crate::settings::EngineSettings;
use crate::sql::{Filter, Operator, Predicate, SelectOptions, SortSpec, SqlBuilder};
use crate::store::{SYSTEM_ENTITIES, SYSTEM_FIELDS, SYSTEM_PERMISSIONS, SYSTEM_RLS, SYSTEM_VIEWS, SYSTEM_WORKFLOWS};
use crate::storage::StorageAdapter;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

pub struct ConfigLoader {
    storage: Arc<dyn StorageAdapter>,
    builder: SqlBuilder,
    settings: EngineSettings,
    cache: ConfigCache,
}

impl ConfigLoader {
    pub fn new(storage: Arc<dyn StorageAdapter>, settings: EngineSettings) -> Self {
        ConfigLoader {
            storage,
            builder: settings.sql_builder(),
            settings,
            cache: ConfigCache::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn builder(&self) -> &SqlBuilder {
        &self.builder
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn cache_key(&self, name: &str, ctx: &Context) -> CacheKey {
        CacheKey::new(ctx.tenant(&self.settings.default_tenant), name, &ctx.role_set())
    }

    /// Configuration of the active entity `name` as seen by the caller's tenant and roles.
    /// `NotFound` when no active entity has that name; failures are never cached.
    pub async fn load_entity(&self, name: &str, ctx: &Context) -> Result<Arc<EntityConfiguration>, EngineError> {
        let tenant = ctx.tenant(&self.settings.default_tenant).to_string();
        let roles = ctx.role_set();
        if !self.settings.cache_enabled {
            self.cache.record_uncached_load();
            return self.fetch(name, &tenant, &roles).await.map(Arc::new);
        }
        let key = self.cache_key(name, ctx);
        self.cache.get_or_load(key, || self.fetch(name, &tenant, &roles)).await
    }

    /// Evict the caller's cached entry and read it again from storage.
    pub async fn reload_entity(&self, name: &str, ctx: &Context) -> Result<Arc<EntityConfiguration>, EngineError> {
        self.cache.evict(&self.cache_key(name, ctx));
        self.load_entity(name, ctx).await
    }

    /// Evict every tenant and role variant of `name`. Returns the number of entries removed.
    pub fn clear_cache(&self, name: &str) -> usize {
        let removed = self.cache.evict_entity(name);
        tracing::debug!(entity = %name, removed, "config cache cleared");
        removed
    }

    pub fn clear_all_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn fetch(&self, name: &str, tenant: &str, roles: &[String]) -> Result<EntityConfiguration, EngineError> {
        tracing::debug!(entity = %name, tenant = %tenant, roles = ?roles, "loading entity configuration");
        let active = Predicate::from(Filter::eq("is_active", true));
        let entity_rows = self
            .rows(
                name,
                SYSTEM_ENTITIES,
                vec![Predicate::from(Filter::eq("name", name)), active.clone()],
                vec![SortSpec::asc("created_at")],
                Some(1),
            )
            .await?;
        let Some(entity_row) = entity_rows.first() else {
            return Err(EngineError::entity_not_found(name));
        };
        let entity = entity_from_row(entity_row);
        let of_entity = Predicate::from(Filter::eq("entity_id", entity.id.clone()));
        let of_roles = Predicate::from(Filter::new(
            "role",
            Operator::In,
            Value::Array(roles.iter().cloned().map(Value::String).collect()),
        ));
        let by_order = vec![SortSpec::asc("order_index"), SortSpec::asc("created_at")];
        let by_creation = vec![SortSpec::asc("created_at")];

        let fields = self
            .rows(name, SYSTEM_FIELDS, vec![of_entity.clone(), active.clone()], by_order.clone(), None)
            .await?
            .iter()
            .filter_map(field_from_row)
            .collect();
        let permissions = self
            .rows(
                name,
                SYSTEM_PERMISSIONS,
                vec![of_entity.clone(), of_roles.clone(), active.clone()],
                by_creation.clone(),
                None,
            )
            .await?
            .iter()
            .filter_map(permission_from_row)
            .collect();
        let views = self
            .rows(name, SYSTEM_VIEWS, vec![of_entity.clone()], by_creation.clone(), None)
            .await?
            .iter()
            .map(view_from_row)
            .collect();
        let workflows = self
            .rows(name, SYSTEM_WORKFLOWS, vec![of_entity.clone(), active.clone()], by_order, None)
            .await?
            .iter()
            .filter_map(workflow_from_row)
            .collect();
        let rls = self
            .rows(name, SYSTEM_RLS, vec![of_entity, of_roles, active], by_creation, None)
            .await?
            .iter()
            .map(rls_from_row)
            .collect();

        Ok(EntityConfiguration {
            entity,
            fields,
            permissions,
            views,
            workflows,
            rls,
            roles: roles.to_vec(),
            tenant: tenant.to_string(),
            loaded_at: Utc::now(),
        })
    }

    /// Query a system table. System tables are shared, so no tenant scoping applies.
    async fn rows(
        &self,
        entity: &str,
        table: &str,
        predicates: Vec<Predicate>,
        sort: Vec<SortSpec>,
        limit: Option<u64>,
    ) -> Result<Vec<Row>, EngineError> {
        let options = SelectOptions {
            sort,
            limit,
            ..SelectOptions::default()
        };
        let q = self
            .builder
            .select(table, &self.settings.default_tenant, &predicates, &options)?;
        self.storage
            .query(&q.sql, &q.params)
            .await
            .map_err(|e| EngineError::SchemaLoad {
                entity: entity.to_string(),
                message: format!("{}: {}", table, e),
            })
    }
}

fn entity_from_row(row: &Row) -> EntityDefinition {
    EntityDefinition {
        id: row_id(row),
        name: row_str(row, "name"),
        table_name: row_str(row, "table_name"),
        display_name: row_opt_str(row, "display_name"),
        description: row_opt_str(row, "description"),
        is_active: row_bool(row, "is_active"),
        metadata: decode_or_default(row, "metadata", SYSTEM_ENTITIES),
        created_at: row_opt_str(row, "created_at"),
        updated_at: row_opt_str(row, "updated_at"),
    }
}

/// Rows with an unknown type are skipped.
fn field_from_row(row: &Row) -> Option<FieldDefinition> {
    let field_type = match row_str(row, "type").parse::<FieldType>() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(table = SYSTEM_FIELDS, id = %row_id(row), error = %e, "skipping field");
            return None;
        }
    };
    Some(FieldDefinition {
        id: row_id(row),
        entity_id: row_str(row, "entity_id"),
        name: row_str(row, "name"),
        field_type,
        is_required: row_bool(row, "is_required"),
        is_unique: row_bool(row, "is_unique"),
        default_value: decode_value(row, "default_value"),
        validation_rules: decode_or_default(row, "validation_rules", SYSTEM_FIELDS),
        order_index: row_i64(row, "order_index"),
        is_active: row_bool(row, "is_active"),
        reference_entity: row_opt_str(row, "reference_entity"),
    })
}

fn permission_from_row(row: &Row) -> Option<PermissionDefinition> {
    let action = match row_str(row, "action").parse::<Action>() {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(table = SYSTEM_PERMISSIONS, id = %row_id(row), error = %e, "skipping permission");
            return None;
        }
    };
    Some(PermissionDefinition {
        id: row_id(row),
        entity_id: row_str(row, "entity_id"),
        role: row_str(row, "role"),
        action,
        is_allowed: row_bool(row, "is_allowed"),
        conditions: decode_or_default(row, "conditions", SYSTEM_PERMISSIONS),
        field_permissions: decode_or_default(row, "field_permissions", SYSTEM_PERMISSIONS),
        is_active: row_bool(row, "is_active"),
    })
}

fn view_from_row(row: &Row) -> ViewDefinition {
    ViewDefinition {
        id: row_id(row),
        entity_id: row_str(row, "entity_id"),
        name: row_str(row, "name"),
        query_config: decode_or_default(row, "query_config", SYSTEM_VIEWS),
        fields: decode_or_default(row, "fields", SYSTEM_VIEWS),
        is_default: row_bool(row, "is_default"),
        is_public: row_bool(row, "is_public"),
    }
}

fn workflow_from_row(row: &Row) -> Option<WorkflowDefinition> {
    let trigger_event = match row_str(row, "trigger_event").parse::<TriggerEvent>() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(table = SYSTEM_WORKFLOWS, id = %row_id(row), error = %e, "skipping workflow");
            return None;
        }
    };
    Some(WorkflowDefinition {
        id: row_id(row),
        entity_id: row_str(row, "entity_id"),
        name: row_str(row, "name"),
        trigger_event,
        conditions: decode_or_default(row, "conditions", SYSTEM_WORKFLOWS),
        actions: decode_or_default(row, "actions", SYSTEM_WORKFLOWS),
        order_index: row_i64(row, "order_index"),
        is_active: row_bool(row, "is_active"),
    })
}

fn rls_from_row(row: &Row) -> RlsDefinition {
    RlsDefinition {
        id: row_id(row),
        entity_id: row_str(row, "entity_id"),
        role: row_str(row, "role"),
        rls_config: decode_or_default(row, "rls_config", SYSTEM_RLS),
        is_active: row_bool(row, "is_active"),
    }
}
