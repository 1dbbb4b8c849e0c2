//! Entity operations: configuration-driven CRUD with permissions, RLS, validation and workflows.

use crate::config::{Action, ConfigLoader, EntityConfiguration, FieldType, JoinKind, JoinSpec, TriggerEvent};
use crate::context::Context;
use crate::error::{EngineError, FieldError};
use crate::migration::{self, SyncOutcome, MANAGED_COLUMNS};
use crate::response::{PageMeta, QueryResult, Record, ViewResult};
use crate::security::{build_rls_conditions, check_permission, permission_summary, require_permission, FieldPermissions};
use crate::service::validation::RecordValidator;
use crate::service::workflow::{self, changed_fields, LoggingExecutor, WorkflowEvent, WorkflowExecutor};
use crate::settings::EngineSettings;
use crate::sql::{parse_filters, Filter, Operator, Predicate, SelectOptions, SortDirection, SortSpec, SqlBuilder};
use crate::storage::StorageAdapter;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Caller options for `find`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FindOptions {
    /// List or map form, see `sql::parse_filters`.
    #[serde(default)]
    pub filters: Value,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
    /// Columns to return; `None` returns every column.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Values for exposed RLS conditions, keyed by field.
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// Caller options for `find_by_view`; each set value overrides the view's default.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ViewOptions {
    #[serde(default)]
    pub filters: Value,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_dir: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

pub struct EntityService {
    loader: Arc<ConfigLoader>,
    executor: Arc<dyn WorkflowExecutor>,
}

impl EntityService {
    pub fn new(storage: Arc<dyn StorageAdapter>, settings: EngineSettings) -> Self {
        Self::with_loader(Arc::new(ConfigLoader::new(storage, settings)))
    }

    pub fn with_loader(loader: Arc<ConfigLoader>) -> Self {
        EntityService {
            loader,
            executor: Arc::new(LoggingExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn WorkflowExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn loader(&self) -> &Arc<ConfigLoader> {
        &self.loader
    }

    fn storage(&self) -> &dyn StorageAdapter {
        self.loader.storage().as_ref()
    }

    fn builder(&self) -> &SqlBuilder {
        self.loader.builder()
    }

    fn settings(&self) -> &EngineSettings {
        self.loader.settings()
    }

    fn tenant<'a>(&'a self, ctx: &'a Context) -> &'a str {
        ctx.tenant(&self.settings().default_tenant)
    }

    async fn authorize(&self, entity: &str, action: Action, ctx: &Context) -> Result<Arc<EntityConfiguration>, EngineError> {
        let config = self.loader.load_entity(entity, ctx).await?;
        require_permission(&config, action, ctx, self.settings().permission_policy)?;
        Ok(config)
    }

    fn field_permissions(&self, config: &EntityConfiguration, action: Action, ctx: &Context) -> FieldPermissions {
        FieldPermissions::resolve(config, action, ctx, self.settings().permission_policy)
    }

    fn rls_predicates(&self, config: &EntityConfiguration, ctx: &Context, inputs: &Map<String, Value>) -> Vec<Predicate> {
        build_rls_conditions(config, ctx, inputs, self.settings())
            .to_predicate()
            .into_iter()
            .collect()
    }

    /// Create a record. Returns the stored record as re-read from storage.
    pub async fn create(&self, entity: &str, data: Record, ctx: &Context) -> Result<Record, EngineError> {
        let config = self.authorize(entity, Action::Create, ctx).await?;
        let field_perms = self.field_permissions(&config, Action::Create, ctx);
        let tenant = self.tenant(ctx).to_string();

        let mut errors = field_perms.check_writable(&data);
        let supplied_id = data.get("id").filter(|v| !v.is_null()).map(value_text);
        let mut record = writable(&config, data);
        for field in config.stored_fields().filter(|f| f.is_active) {
            if record.get(&field.name).map_or(true, Value::is_null) {
                if let Some(default) = &field.default_value {
                    record.insert(field.name.clone(), ctx.resolve_value(default));
                }
            }
        }
        errors.extend(RecordValidator::validate(&config, &record));
        errors.extend(self.unique_violations(&config, &tenant, &record, None).await?);
        if let Some(id) = &supplied_id {
            let taken = vec![Predicate::from(Filter::eq("id", id.as_str()))];
            if self.count_rows(config.table_name(), &tenant, &taken).await? > 0 {
                errors.push(FieldError::new("id", "unique", "id must be unique"));
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::validation(config.name(), errors));
        }

        let id = supplied_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Value::String(Utc::now().to_rfc3339());
        let user = actor(ctx);
        record.insert("id".into(), Value::String(id.clone()));
        record.insert("created_at".into(), now.clone());
        record.insert("updated_at".into(), now);
        record.insert("created_by".into(), user.clone());
        record.insert("updated_by".into(), user);

        self.run_workflows(&config, TriggerEvent::BeforeCreate, &record, None, Vec::new(), ctx)
            .await?;
        let q = self
            .builder()
            .insert(config.table_name(), &tenant, &encode_json_fields(&config, record))?;
        self.storage()
            .execute(&q.sql, &q.params)
            .await
            .map_err(|e| EngineError::storage("create", e))?;
        tracing::debug!(entity = %config.name(), operation = "create", id = %id, "record created");

        let stored = self
            .fetch_one(&config, &tenant, &id, Vec::new())
            .await?
            .ok_or_else(|| EngineError::record_not_found(config.name(), id.as_str()))?;
        self.run_workflows(&config, TriggerEvent::AfterCreate, &stored, None, Vec::new(), ctx)
            .await?;
        Ok(strip(&field_perms, stored))
    }

    /// Fetch one record. `NotFound` when it does not exist or RLS hides it.
    pub async fn find_by_id(&self, entity: &str, id: &str, ctx: &Context) -> Result<Record, EngineError> {
        let config = self.authorize(entity, Action::Read, ctx).await?;
        let rls = self.rls_predicates(&config, ctx, &Map::new());
        let record = self
            .fetch_one(&config, self.tenant(ctx), id, rls)
            .await?
            .ok_or_else(|| EngineError::record_not_found(config.name(), id))?;
        Ok(strip(&self.field_permissions(&config, Action::Read, ctx), record))
    }

    /// Partially update a record. Returns the stored record as re-read from storage under the
    /// caller's RLS; `NotFound` when the write moved the record out of view.
    pub async fn update(&self, entity: &str, id: &str, data: Record, ctx: &Context) -> Result<Record, EngineError> {
        let config = self.authorize(entity, Action::Update, ctx).await?;
        let field_perms = self.field_permissions(&config, Action::Update, ctx);
        let tenant = self.tenant(ctx).to_string();

        let mut errors = field_perms.check_writable(&data);
        let mut changes = writable(&config, data);
        errors.extend(RecordValidator::validate_partial(&config, &changes));
        errors.extend(self.unique_violations(&config, &tenant, &changes, Some(id)).await?);
        if !errors.is_empty() {
            return Err(EngineError::validation(config.name(), errors));
        }

        let rls = self.rls_predicates(&config, ctx, &Map::new());
        let previous = self
            .fetch_one(&config, &tenant, id, rls.clone())
            .await?
            .ok_or_else(|| EngineError::record_not_found(config.name(), id))?;
        let mut merged = previous.clone();
        merged.extend(changes.clone());
        let changed: Vec<String> = changed_fields(&previous, &merged)
            .into_iter()
            .filter(|f| !MANAGED_COLUMNS.contains(&f.as_str()))
            .collect();
        self.run_workflows(&config, TriggerEvent::BeforeUpdate, &merged, Some(&previous), changed.clone(), ctx)
            .await?;

        changes.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
        changes.insert("updated_by".into(), actor(ctx));
        let q = self.builder().update(
            config.table_name(),
            &tenant,
            &Value::String(id.to_string()),
            &encode_json_fields(&config, changes),
            &rls,
        )?;
        let result = self
            .storage()
            .execute(&q.sql, &q.params)
            .await
            .map_err(|e| EngineError::storage("update", e))?;
        if result.changes == 0 {
            return Err(EngineError::record_not_found(config.name(), id));
        }
        tracing::debug!(entity = %config.name(), operation = "update", id = %id, changed = ?changed, "record updated");

        // The change may move the row out of the caller's visibility.
        let stored = self
            .fetch_one(&config, &tenant, id, rls)
            .await?
            .ok_or_else(|| EngineError::record_not_found(config.name(), id))?;
        self.run_workflows(&config, TriggerEvent::AfterUpdate, &stored, Some(&previous), changed.clone(), ctx)
            .await?;
        if !changed.is_empty() {
            self.run_workflows(&config, TriggerEvent::FieldChange, &stored, Some(&previous), changed, ctx)
                .await?;
        }
        Ok(strip(&field_perms, stored))
    }

    /// Delete a record. `NotFound` when it does not exist or RLS hides it.
    pub async fn delete(&self, entity: &str, id: &str, ctx: &Context) -> Result<(), EngineError> {
        let config = self.authorize(entity, Action::Delete, ctx).await?;
        let tenant = self.tenant(ctx).to_string();
        let rls = self.rls_predicates(&config, ctx, &Map::new());
        let previous = self
            .fetch_one(&config, &tenant, id, rls.clone())
            .await?
            .ok_or_else(|| EngineError::record_not_found(config.name(), id))?;
        self.run_workflows(&config, TriggerEvent::BeforeDelete, &previous, None, Vec::new(), ctx)
            .await?;

        let q = self
            .builder()
            .delete(config.table_name(), &tenant, &Value::String(id.to_string()), &rls)?;
        let result = self
            .storage()
            .execute(&q.sql, &q.params)
            .await
            .map_err(|e| EngineError::storage("delete", e))?;
        if result.changes == 0 {
            return Err(EngineError::record_not_found(config.name(), id));
        }
        tracing::debug!(entity = %config.name(), operation = "delete", id = %id, "record deleted");
        self.run_workflows(&config, TriggerEvent::AfterDelete, &previous, None, Vec::new(), ctx)
            .await
    }

    /// One page of records matching the caller's filters and RLS.
    pub async fn find(&self, entity: &str, options: FindOptions, ctx: &Context) -> Result<QueryResult, EngineError> {
        let config = self.authorize(entity, Action::List, ctx).await?;
        let tenant = self.tenant(ctx);
        let mut predicates = filter_predicates(&options.filters)?;
        predicates.extend(self.rls_predicates(&config, ctx, &options.inputs));

        let per_page = self.settings().page_size(options.per_page);
        let page = options.page.unwrap_or(1).max(1);
        let total = self.count_rows(config.table_name(), tenant, &predicates).await?;
        let meta = PageMeta::new(total, page, per_page);
        let select = SelectOptions {
            fields: options.fields,
            sort: options.sort,
            limit: Some(per_page),
            offset: Some(meta.offset()),
        };
        let rows = self
            .select_rows("find", config.table_name(), tenant, &predicates, &select)
            .await?;
        let field_perms = self.field_permissions(&config, Action::List, ctx);
        let data = rows
            .into_iter()
            .map(|r| strip(&field_perms, decode_json_fields(&config, r)))
            .collect();
        Ok(QueryResult { data, meta })
    }

    /// Number of records matching `filters` that the caller can see.
    pub async fn count(&self, entity: &str, filters: &Value, ctx: &Context) -> Result<u64, EngineError> {
        let config = self.authorize(entity, Action::List, ctx).await?;
        let mut predicates = filter_predicates(filters)?;
        predicates.extend(self.rls_predicates(&config, ctx, &Map::new()));
        self.count_rows(config.table_name(), self.tenant(ctx), &predicates)
            .await
    }

    /// Run a stored view. Public views skip the `list` permission check.
    pub async fn find_by_view(
        &self,
        entity: &str,
        view_name: &str,
        options: ViewOptions,
        ctx: &Context,
    ) -> Result<ViewResult, EngineError> {
        let config = self.loader.load_entity(entity, ctx).await?;
        let policy = self.settings().permission_policy;
        let view = config.view(view_name).ok_or_else(|| EngineError::NotFound {
            entity: config.name().to_string(),
            id: Some(format!("view {}", view_name)),
        })?;
        if !view.is_public {
            require_permission(&config, Action::List, ctx, policy)?;
        }
        let tenant = self.tenant(ctx);
        let query = &view.query_config;

        let mut predicates: Vec<Predicate> = parse_filters(&query.filters)?
            .into_iter()
            .map(|mut f| {
                f.value = ctx.resolve_value(&f.value);
                Predicate::from(f)
            })
            .collect();
        predicates.extend(filter_predicates(&options.filters)?);
        predicates.extend(self.rls_predicates(&config, ctx, &options.inputs));

        let sort = match &options.sort_by {
            Some(field) => {
                let direction = match options.sort_dir.as_deref() {
                    Some(dir) => dir.parse::<SortDirection>()?,
                    None => SortDirection::Asc,
                };
                vec![SortSpec {
                    field: field.clone(),
                    direction,
                }]
            }
            None => query.sorting.clone(),
        };
        let page = options.page.or(query.pagination.page).unwrap_or(1).max(1);
        let per_page = self
            .settings()
            .page_size(options.per_page.or(query.pagination.per_page));

        let total = self.count_rows(config.table_name(), tenant, &predicates).await?;
        let meta = PageMeta::new(total, page, per_page);
        let select = SelectOptions {
            sort,
            limit: Some(per_page),
            offset: Some(meta.offset()),
            ..SelectOptions::default()
        };
        let field_perms = self.field_permissions(&config, Action::List, ctx);
        let mut data: Vec<Record> = self
            .select_rows("find_by_view", config.table_name(), tenant, &predicates, &select)
            .await?
            .into_iter()
            .map(|r| strip(&field_perms, decode_json_fields(&config, r)))
            .collect();
        self.attach_joins(&query.joins, tenant, ctx, &mut data).await?;
        if !view.fields.is_empty() {
            for row in &mut data {
                row.retain(|k, _| view.fields.contains(k) || query.joins.iter().any(|j| &j.alias == k));
            }
        }
        tracing::debug!(entity = %config.name(), view = %view.name, total, page, per_page, "view queried");

        Ok(ViewResult {
            data,
            meta,
            permissions: permission_summary(&config, ctx, policy),
        })
    }

    /// Create the entity's data table from its fields when it does not exist yet.
    /// Requires `create` permission on the entity.
    pub async fn sync_table(&self, entity: &str, ctx: &Context) -> Result<SyncOutcome, EngineError> {
        let config = self.authorize(entity, Action::Create, ctx).await?;
        migration::sync_entity_table(self.storage(), &config, self.builder().tenants(), self.tenant(ctx)).await
    }

    /// Attach related records under each join's alias using one `IN` lookup per join.
    /// A related entity the caller cannot read attaches nothing.
    async fn attach_joins(&self, joins: &[JoinSpec], tenant: &str, ctx: &Context, rows: &mut [Record]) -> Result<(), EngineError> {
        let policy = self.settings().permission_policy;
        for join in joins {
            let related = match (&join.entity, &join.table) {
                (Some(name), _) => Some(self.loader.load_entity(name, ctx).await?),
                (None, Some(_)) => None,
                (None, None) => {
                    return Err(EngineError::QueryBuild(format!(
                        "join '{}' names neither an entity nor a table",
                        join.alias
                    )))
                }
            };
            let table = match (&related, &join.table) {
                (Some(cfg), _) => cfg.table_name().to_string(),
                (None, Some(t)) => t.clone(),
                (None, None) => continue,
            };

            let readable = related
                .as_ref()
                .map_or(true, |cfg| check_permission(cfg, Action::Read, ctx, policy));
            if !readable {
                tracing::debug!(join = %join.alias, table = %table, "no read permission on joined entity, skipping");
            }

            let mut keys: Vec<Value> = Vec::new();
            for row in rows.iter() {
                if let Some(v) = row.get(&join.local_field).filter(|v| !v.is_null()) {
                    if !keys.contains(v) {
                        keys.push(v.clone());
                    }
                }
            }
            let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
            if readable && !keys.is_empty() {
                let mut predicates = vec![Predicate::from(Filter::new(
                    join.foreign_field.clone(),
                    Operator::In,
                    Value::Array(keys),
                ))];
                if let Some(cfg) = &related {
                    predicates.extend(self.rls_predicates(cfg, ctx, &Map::new()));
                }
                let found = self
                    .select_rows("join", &table, tenant, &predicates, &SelectOptions::default())
                    .await?;
                for r in found {
                    let key = value_text(r.get(&join.foreign_field).unwrap_or(&Value::Null));
                    let mut r = match &related {
                        Some(cfg) => strip(
                            &self.field_permissions(cfg, Action::Read, ctx),
                            decode_json_fields(cfg, r),
                        ),
                        None => r,
                    };
                    if let Some(fields) = &join.fields {
                        r.retain(|k, _| fields.contains(k));
                    }
                    grouped.entry(key).or_default().push(r);
                }
            }

            for row in rows.iter_mut() {
                let matches = row
                    .get(&join.local_field)
                    .filter(|v| !v.is_null())
                    .and_then(|v| grouped.get(&value_text(v)));
                let value = match join.kind {
                    JoinKind::One => matches
                        .and_then(|m| m.first())
                        .cloned()
                        .map(Value::Object)
                        .unwrap_or(Value::Null),
                    JoinKind::Many => Value::Array(
                        matches
                            .map(|m| m.iter().cloned().map(Value::Object).collect())
                            .unwrap_or_default(),
                    ),
                };
                row.insert(join.alias.clone(), value);
            }
        }
        Ok(())
    }

    async fn run_workflows(
        &self,
        config: &EntityConfiguration,
        trigger: TriggerEvent,
        record: &Record,
        previous: Option<&Record>,
        changed: Vec<String>,
        ctx: &Context,
    ) -> Result<(), EngineError> {
        if config.workflows_for(trigger).next().is_none() {
            return Ok(());
        }
        let event = WorkflowEvent {
            entity: config.name().to_string(),
            trigger,
            record: record.clone(),
            previous: previous.cloned(),
            changed_fields: changed,
            tenant: self.tenant(ctx).to_string(),
            user_id: ctx.user_id().map(str::to_string),
        };
        workflow::dispatch(self.executor.as_ref(), config, &event, ctx).await
    }

    /// `unique` errors for unique fields in `data` whose value another record already holds.
    async fn unique_violations(
        &self,
        config: &EntityConfiguration,
        tenant: &str,
        data: &Record,
        exclude_id: Option<&str>,
    ) -> Result<Vec<FieldError>, EngineError> {
        let mut errors = Vec::new();
        for field in config.stored_fields().filter(|f| f.is_active && f.is_unique) {
            let Some(value) = data.get(&field.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let mut predicates = vec![Predicate::from(Filter::eq(field.name.clone(), value.clone()))];
            if let Some(id) = exclude_id {
                predicates.push(Filter::new("id", Operator::Neq, id).into());
            }
            if self.count_rows(config.table_name(), tenant, &predicates).await? > 0 {
                errors.push(FieldError::new(
                    field.name.clone(),
                    "unique",
                    format!("{} must be unique", field.name),
                ));
            }
        }
        Ok(errors)
    }

    /// Fetch by id within the tenant, with extra predicates (RLS). JSON fields come back decoded.
    async fn fetch_one(
        &self,
        config: &EntityConfiguration,
        tenant: &str,
        id: &str,
        extra: Vec<Predicate>,
    ) -> Result<Option<Record>, EngineError> {
        let mut predicates = vec![Predicate::from(Filter::eq("id", id))];
        predicates.extend(extra);
        let options = SelectOptions {
            limit: Some(1),
            ..SelectOptions::default()
        };
        let rows = self
            .select_rows("find_by_id", config.table_name(), tenant, &predicates, &options)
            .await?;
        Ok(rows.into_iter().next().map(|r| decode_json_fields(config, r)))
    }

    async fn select_rows(
        &self,
        operation: &str,
        table: &str,
        tenant: &str,
        predicates: &[Predicate],
        options: &SelectOptions,
    ) -> Result<Vec<Record>, EngineError> {
        let q = self.builder().select(table, tenant, predicates, options)?;
        self.storage()
            .query(&q.sql, &q.params)
            .await
            .map_err(|e| EngineError::storage(operation, e))
    }

    async fn count_rows(&self, table: &str, tenant: &str, predicates: &[Predicate]) -> Result<u64, EngineError> {
        let q = self.builder().count(table, tenant, predicates)?;
        let rows = self
            .storage()
            .query(&q.sql, &q.params)
            .await
            .map_err(|e| EngineError::storage("count", e))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(0))
    }
}

fn filter_predicates(raw: &Value) -> Result<Vec<Predicate>, EngineError> {
    Ok(parse_filters(raw)?.into_iter().map(Predicate::from).collect())
}

fn actor(ctx: &Context) -> Value {
    ctx.user_id()
        .map(|u| Value::String(u.to_string()))
        .unwrap_or(Value::Null)
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Keep only keys that are active, stored fields of the entity.
fn writable(config: &EntityConfiguration, data: Record) -> Record {
    let (kept, dropped): (Vec<_>, Vec<_>) = data.into_iter().partition(|(k, _)| {
        config
            .field(k)
            .is_some_and(|f| f.is_active && f.field_type != FieldType::Computed)
    });
    if !dropped.is_empty() {
        let keys: Vec<&String> = dropped.iter().map(|(k, _)| k).collect();
        tracing::debug!(entity = %config.name(), dropped = ?keys, "ignoring unknown or computed keys");
    }
    kept.into_iter().collect()
}

/// JSON-typed fields are stored as text.
fn encode_json_fields(config: &EntityConfiguration, mut record: Record) -> Record {
    for field in config.stored_fields().filter(|f| f.field_type.is_json()) {
        if let Some(v) = record.get_mut(&field.name) {
            if !v.is_null() {
                *v = Value::String(v.to_string());
            }
        }
    }
    record
}

/// Parse JSON-typed fields back from text; text that is not JSON is left as is.
fn decode_json_fields(config: &EntityConfiguration, mut record: Record) -> Record {
    for field in config.stored_fields().filter(|f| f.field_type.is_json()) {
        let parsed = match record.get(&field.name) {
            Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok(),
            _ => None,
        };
        if let Some(v) = parsed {
            record.insert(field.name.clone(), v);
        }
    }
    record
}

fn strip(field_perms: &FieldPermissions, mut record: Record) -> Record {
    field_perms.strip(&mut record);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntityDefinition, FieldDefinition};
    use serde_json::json;

    fn config() -> EntityConfiguration {
        let mut cfg = EntityConfiguration::new(EntityDefinition::new("e1", "doc", "docs"));
        cfg.fields = vec![
            FieldDefinition::new("e1", "title", FieldType::String),
            FieldDefinition::new("e1", "meta", FieldType::Object),
            FieldDefinition::new("e1", "tags", FieldType::Array),
            FieldDefinition::new("e1", "summary", FieldType::Computed),
        ];
        cfg
    }

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn json_fields_round_trip_through_text() {
        let cfg = config();
        let encoded = encode_json_fields(&cfg, record(json!({ "title": "a", "meta": { "k": 1 }, "tags": ["x"] })));
        assert_eq!(encoded["meta"], json!("{\"k\":1}"));
        assert_eq!(encoded["tags"], json!("[\"x\"]"));
        assert_eq!(encoded["title"], json!("a"));
        let decoded = decode_json_fields(&cfg, encoded);
        assert_eq!(decoded["meta"], json!({ "k": 1 }));
    }

    #[test]
    fn writable_drops_unknown_and_computed_keys() {
        let kept = writable(&config(), record(json!({ "title": "a", "summary": "s", "hack": 1, "id": "x" })));
        assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["title"]);
    }
}
