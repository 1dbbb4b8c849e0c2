//! Definition types stored in the system tables, and the assembled `EntityConfiguration`.

use crate::sql::{Relation, SortSpec};
use crate::storage::ColumnType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    List,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::List => "list",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "read" => Ok(Action::Read),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "list" => Ok(Action::List),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Datetime,
    Json,
    Object,
    Array,
    Reference,
    Computed,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Json => "json",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Reference => "reference",
            FieldType::Computed => "computed",
        }
    }

    /// Stored as JSON text and parsed back on read.
    pub fn is_json(self) -> bool {
        matches!(self, FieldType::Json | FieldType::Object | FieldType::Array)
    }

    /// Column type for the entity's data table; computed fields have no column.
    pub fn column_type(self) -> Option<ColumnType> {
        match self {
            FieldType::String | FieldType::Reference | FieldType::Date => Some(ColumnType::Text),
            FieldType::Number => Some(ColumnType::Real),
            FieldType::Integer => Some(ColumnType::Integer),
            FieldType::Boolean => Some(ColumnType::Boolean),
            FieldType::Datetime => Some(ColumnType::Timestamp),
            FieldType::Json | FieldType::Object | FieldType::Array => Some(ColumnType::Json),
            FieldType::Computed => None,
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s.trim().to_lowercase().as_str() {
            "string" | "text" => FieldType::String,
            "number" | "float" | "decimal" => FieldType::Number,
            "integer" | "int" => FieldType::Integer,
            "boolean" | "bool" => FieldType::Boolean,
            "date" => FieldType::Date,
            "datetime" | "timestamp" => FieldType::Datetime,
            "json" => FieldType::Json,
            "object" => FieldType::Object,
            "array" => FieldType::Array,
            "reference" => FieldType::Reference,
            "computed" => FieldType::Computed,
            other => return Err(format!("unknown field type: {}", other)),
        };
        Ok(t)
    }
}

/// Per-field validation rules, stored as JSON text in `system_fields.validation_rules`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default, rename = "minLength", alias = "min_length", skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(default, rename = "maxLength", alias = "max_length", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub email: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub id: String,
    pub name: String,
    pub table_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl EntityDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, table_name: impl Into<String>) -> Self {
        EntityDefinition {
            id: id.into(),
            name: name.into(),
            table_name: table_name.into(),
            display_name: None,
            description: None,
            is_active: true,
            metadata: Map::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: String,
    pub entity_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation_rules: ValidationRules,
    #[serde(default)]
    pub order_index: i64,
    pub is_active: bool,
    #[serde(default)]
    pub reference_entity: Option<String>,
}

impl FieldDefinition {
    pub fn new(entity_id: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        let entity_id = entity_id.into();
        let name = name.into();
        FieldDefinition {
            id: format!("{}.{}", entity_id, name),
            entity_id,
            name,
            field_type,
            is_required: false,
            is_unique: false,
            default_value: None,
            validation_rules: ValidationRules::default(),
            order_index: 0,
            is_active: true,
            reference_entity: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = rules;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub id: String,
    pub entity_id: String,
    pub role: String,
    pub action: Action,
    pub is_allowed: bool,
    #[serde(default)]
    pub conditions: Map<String, Value>,
    /// `field -> {read?: bool, write?: bool}` or `field -> bool`.
    #[serde(default)]
    pub field_permissions: Map<String, Value>,
    pub is_active: bool,
}

impl PermissionDefinition {
    pub fn new(entity_id: impl Into<String>, role: impl Into<String>, action: Action, is_allowed: bool) -> Self {
        let entity_id = entity_id.into();
        let role = role.into();
        PermissionDefinition {
            id: format!("{}.{}.{}", entity_id, role, action),
            entity_id,
            role,
            action,
            is_allowed,
            conditions: Map::new(),
            field_permissions: Map::new(),
            is_active: true,
        }
    }

    pub fn allow(entity_id: impl Into<String>, role: impl Into<String>, action: Action) -> Self {
        Self::new(entity_id, role, action, true)
    }

    pub fn with_field_permissions(mut self, fields: Map<String, Value>) -> Self {
        self.field_permissions = fields;
        self
    }
}

/// One `{field, op, value}` triple as stored in RLS rules and workflow conditions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(alias = "operator", default = "default_op")]
    pub op: String,
    #[serde(default)]
    pub value: Value,
    /// Caller may override `value` through an input keyed by `field`.
    #[serde(default)]
    pub exposed: bool,
}

fn default_op() -> String {
    "eq".to_string()
}

impl Condition {
    pub fn new(field: impl Into<String>, op: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition {
            field: field.into(),
            op: op.into(),
            value: value.into(),
            exposed: false,
        }
    }

    pub fn exposed(mut self) -> Self {
        self.exposed = true;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RlsConfig {
    #[serde(rename = "relationbetweenconditions", default)]
    pub relation: Relation,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RlsDefinition {
    pub id: String,
    pub entity_id: String,
    pub role: String,
    pub rls_config: RlsConfig,
    pub is_active: bool,
}

impl RlsDefinition {
    pub fn new(entity_id: impl Into<String>, role: impl Into<String>, relation: Relation, conditions: Vec<Condition>) -> Self {
        let entity_id = entity_id.into();
        let role = role.into();
        RlsDefinition {
            id: format!("{}.{}.{}", entity_id, role, uuid::Uuid::new_v4()),
            entity_id,
            role,
            rls_config: RlsConfig { relation, conditions },
            is_active: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    One,
    Many,
}

/// Related records attached under `alias` by a batched `IN` lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Related entity name; its table is resolved through its configuration.
    #[serde(default)]
    pub entity: Option<String>,
    /// Raw related table, used when `entity` is absent.
    #[serde(default)]
    pub table: Option<String>,
    pub local_field: String,
    #[serde(default = "default_foreign_field")]
    pub foreign_field: String,
    pub alias: String,
    #[serde(rename = "type", default)]
    pub kind: JoinKind,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

fn default_foreign_field() -> String {
    "id".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationDefaults {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// List or map form, see `sql::parse_filters`.
    #[serde(default)]
    pub filters: Value,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub sorting: Vec<SortSpec>,
    #[serde(default)]
    pub pagination: PaginationDefaults,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub id: String,
    pub entity_id: String,
    pub name: String,
    #[serde(default)]
    pub query_config: QueryConfig,
    /// Projection allow-list; empty means all columns.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_public: bool,
}

impl ViewDefinition {
    pub fn new(entity_id: impl Into<String>, name: impl Into<String>, query_config: QueryConfig) -> Self {
        let entity_id = entity_id.into();
        let name = name.into();
        ViewDefinition {
            id: format!("{}.{}", entity_id, name),
            entity_id,
            name,
            query_config,
            fields: Vec::new(),
            is_default: false,
            is_public: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    FieldChange,
}

impl TriggerEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerEvent::BeforeCreate => "before_create",
            TriggerEvent::AfterCreate => "after_create",
            TriggerEvent::BeforeUpdate => "before_update",
            TriggerEvent::AfterUpdate => "after_update",
            TriggerEvent::BeforeDelete => "before_delete",
            TriggerEvent::AfterDelete => "after_delete",
            TriggerEvent::FieldChange => "field_change",
        }
    }

    /// Failures of `before_*` hooks abort the operation.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            TriggerEvent::BeforeCreate | TriggerEvent::BeforeUpdate | TriggerEvent::BeforeDelete
        )
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s.trim().to_lowercase().as_str() {
            "before_create" => TriggerEvent::BeforeCreate,
            "after_create" | "create" => TriggerEvent::AfterCreate,
            "before_update" => TriggerEvent::BeforeUpdate,
            "after_update" | "update" => TriggerEvent::AfterUpdate,
            "before_delete" => TriggerEvent::BeforeDelete,
            "after_delete" | "delete" => TriggerEvent::AfterDelete,
            "field_change" => TriggerEvent::FieldChange,
            other => return Err(format!("unknown trigger event: {}", other)),
        };
        Ok(t)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub entity_id: String,
    pub name: String,
    pub trigger_event: TriggerEvent,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Typed action objects, interpreted by the workflow executor.
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub order_index: i64,
    pub is_active: bool,
}

impl WorkflowDefinition {
    pub fn new(entity_id: impl Into<String>, name: impl Into<String>, trigger_event: TriggerEvent) -> Self {
        let entity_id = entity_id.into();
        let name = name.into();
        WorkflowDefinition {
            id: format!("{}.{}", entity_id, name),
            entity_id,
            name,
            trigger_event,
            conditions: Vec::new(),
            actions: Vec::new(),
            order_index: 0,
            is_active: true,
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Immutable snapshot of one entity's configuration for one tenant and role set.
#[derive(Clone, Debug, Serialize)]
pub struct EntityConfiguration {
    pub entity: EntityDefinition,
    pub fields: Vec<FieldDefinition>,
    /// Only rows whose role is in `roles`.
    pub permissions: Vec<PermissionDefinition>,
    pub views: Vec<ViewDefinition>,
    pub workflows: Vec<WorkflowDefinition>,
    /// Only rows whose role is in `roles`.
    pub rls: Vec<RlsDefinition>,
    /// Sorted role set the configuration was loaded for.
    pub roles: Vec<String>,
    pub tenant: String,
    pub loaded_at: DateTime<Utc>,
}

impl EntityConfiguration {
    /// Configuration with no fields, permissions, views, workflows or RLS rules.
    pub fn new(entity: EntityDefinition) -> Self {
        EntityConfiguration {
            entity,
            fields: Vec::new(),
            permissions: Vec::new(),
            views: Vec::new(),
            workflows: Vec::new(),
            rls: Vec::new(),
            roles: Vec::new(),
            tenant: String::new(),
            loaded_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.entity.name
    }

    pub fn table_name(&self) -> &str {
        &self.entity.table_name
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields that map to a column of the data table.
    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.field_type != FieldType::Computed)
    }

    pub fn view(&self, name: &str) -> Option<&ViewDefinition> {
        self.views.iter().find(|v| v.name == name)
    }

    pub fn default_view(&self) -> Option<&ViewDefinition> {
        self.views.iter().find(|v| v.is_default)
    }

    /// Active workflows for `trigger`, in `order_index` order.
    pub fn workflows_for(&self, trigger: TriggerEvent) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows
            .iter()
            .filter(move |w| w.is_active && w.trigger_event == trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_rules_accept_camel_and_snake_case() {
        let rules: ValidationRules =
            serde_json::from_value(json!({ "minLength": 2, "max_length": 5, "enum": ["a"], "email": true })).unwrap();
        assert_eq!(rules.min_length, Some(2));
        assert_eq!(rules.max_length, Some(5));
        assert_eq!(rules.allowed, Some(vec![json!("a")]));
        assert!(rules.email);
    }

    #[test]
    fn rls_config_defaults_to_and() {
        let cfg: RlsConfig =
            serde_json::from_value(json!({ "conditions": [{ "field": "owner_id", "operator": "=", "value": "currentUser.id" }] }))
                .unwrap();
        assert_eq!(cfg.relation, Relation::And);
        assert_eq!(cfg.conditions[0].op, "=");
        assert!(!cfg.conditions[0].exposed);
        assert_eq!(RlsConfig::default().conditions.len(), 0);
    }

    #[test]
    fn join_spec_defaults() {
        let join: JoinSpec =
            serde_json::from_value(json!({ "entity": "team", "local_field": "team_id", "alias": "team" })).unwrap();
        assert_eq!(join.foreign_field, "id");
        assert_eq!(join.kind, JoinKind::One);
    }

    #[test]
    fn trigger_events_parse() {
        assert_eq!("before_update".parse::<TriggerEvent>().unwrap(), TriggerEvent::BeforeUpdate);
        assert!(TriggerEvent::BeforeDelete.is_blocking());
        assert!(!TriggerEvent::FieldChange.is_blocking());
        assert_eq!("LIST".parse::<Action>().unwrap(), Action::List);
    }
}
