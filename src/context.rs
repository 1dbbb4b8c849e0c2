//! Caller context: user, roles, tenant, request/session data, and placeholder resolution against it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role used when the caller carries no roles.
pub const PUBLIC_ROLE: &str = "public";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Extra user attributes reachable from placeholders (`currentUser.department`).
    #[serde(default, flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub user: Option<UserContext>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub request: Option<Value>,
    #[serde(default)]
    pub session: Option<Value>,
}

impl Context {
    pub fn anonymous() -> Self {
        Context::default()
    }

    pub fn for_user(id: impl Into<String>, roles: &[&str]) -> Self {
        Context {
            user: Some(UserContext {
                id: id.into(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
                attributes: Map::new(),
            }),
            ..Context::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Some(user) = self.user.as_mut() {
            user.attributes.insert(key.into(), value);
        }
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Effective roles: the user's roles, or `["public"]` when there are none.
    pub fn roles(&self) -> Vec<String> {
        match &self.user {
            Some(u) if !u.roles.is_empty() => u.roles.clone(),
            _ => vec![PUBLIC_ROLE.to_string()],
        }
    }

    /// Sorted, de-duplicated effective roles. Stable across callers with the same role set.
    pub fn role_set(&self) -> Vec<String> {
        let mut roles = self.roles();
        roles.sort();
        roles.dedup();
        roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles().iter().any(|r| r == role)
    }

    /// Tenant id, or `default_tenant` when unset or blank.
    pub fn tenant<'a>(&'a self, default_tenant: &'a str) -> &'a str {
        self.tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(default_tenant)
    }

    /// JSON view used for placeholder paths (`user.id`, `tenantId`, `session.x`).
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        if let Some(user) = &self.user {
            let mut u = user.attributes.clone();
            u.insert("id".into(), Value::String(user.id.clone()));
            u.insert(
                "roles".into(),
                Value::Array(user.roles.iter().cloned().map(Value::String).collect()),
            );
            root.insert("user".into(), Value::Object(u));
        }
        if let Some(t) = &self.tenant_id {
            root.insert("tenantId".into(), Value::String(t.clone()));
            root.insert("tenant_id".into(), Value::String(t.clone()));
        }
        if let Some(r) = &self.request {
            root.insert("request".into(), r.clone());
        }
        if let Some(s) = &self.session {
            root.insert("session".into(), s.clone());
        }
        Value::Object(root)
    }

    /// Resolve a symbolic value. Returns `None` when `raw` is not a placeholder;
    /// a placeholder whose path is missing resolves to `Some(Value::Null)`.
    ///
    /// Recognized forms: `currentUser.<path>`, `$user.<path>`, `$context.<path>`,
    /// `$tenant`, `$now`.
    pub fn resolve_placeholder(&self, raw: &str) -> Option<Value> {
        let raw = raw.trim();
        let path = if let Some(rest) = raw.strip_prefix("currentUser.") {
            format!("user.{}", rest)
        } else if let Some(rest) = raw.strip_prefix("$user.") {
            format!("user.{}", rest)
        } else if let Some(rest) = raw.strip_prefix("$context.") {
            rest.to_string()
        } else if raw == "$tenant" {
            "tenantId".to_string()
        } else if raw == "$now" {
            return Some(Value::String(chrono::Utc::now().to_rfc3339()));
        } else {
            return None;
        };
        let root = self.to_value();
        let mut cur = &root;
        for seg in path.split('.') {
            match cur.get(seg) {
                Some(next) => cur = next,
                None => return Some(Value::Null),
            }
        }
        Some(cur.clone())
    }

    /// Resolve placeholders inside a value (strings and arrays of strings); other values are returned unchanged.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_placeholder(s).unwrap_or_else(|| value.clone()),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            other => other.clone(),
        }
    }
}
