//! Action permissions and field-level permissions.

use crate::config::{Action, EntityConfiguration, PermissionDefinition};
use crate::context::Context;
use crate::error::{EngineError, FieldError};
use crate::response::PermissionSummary;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How matching permission rows combine.
///
/// `AnyAllow` grants when any matching row allows, regardless of denies. This is the
/// compatible default and a known weakness: an explicit deny cannot revoke a grant held
/// through another role. `DenyOverrides` refuses when any matching row denies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    #[default]
    AnyAllow,
    DenyOverrides,
}

impl fmt::Display for PermissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PermissionPolicy::AnyAllow => "any_allow",
            PermissionPolicy::DenyOverrides => "deny_overrides",
        })
    }
}

impl FromStr for PermissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "any_allow" | "allow" => Ok(PermissionPolicy::AnyAllow),
            "deny_overrides" | "deny" => Ok(PermissionPolicy::DenyOverrides),
            other => Err(format!(
                "invalid permission policy: {} (expected any_allow or deny_overrides)",
                other
            )),
        }
    }
}

fn matching<'a>(
    config: &'a EntityConfiguration,
    action: Action,
    roles: &'a [String],
) -> impl Iterator<Item = &'a PermissionDefinition> {
    config
        .permissions
        .iter()
        .filter(move |p| p.is_active && p.action == action && roles.iter().any(|r| *r == p.role))
}

/// Whether the caller may perform `action`. Callers without roles act as `public`.
pub fn check_permission(config: &EntityConfiguration, action: Action, ctx: &Context, policy: PermissionPolicy) -> bool {
    let roles = ctx.roles();
    let mut allowed = false;
    let mut denied = false;
    for p in matching(config, action, &roles) {
        if p.is_allowed {
            allowed = true;
        } else {
            denied = true;
        }
    }
    match policy {
        PermissionPolicy::AnyAllow => allowed,
        PermissionPolicy::DenyOverrides => allowed && !denied,
    }
}

/// Like `check_permission`, but a denial becomes `EngineError::Permission`.
pub fn require_permission(
    config: &EntityConfiguration,
    action: Action,
    ctx: &Context,
    policy: PermissionPolicy,
) -> Result<(), EngineError> {
    if check_permission(config, action, ctx, policy) {
        return Ok(());
    }
    tracing::debug!(entity = %config.name(), action = %action, roles = ?ctx.roles(), "permission denied");
    Err(EngineError::Permission {
        entity: config.name().to_string(),
        action,
        roles: ctx.roles(),
    })
}

pub fn permission_summary(config: &EntityConfiguration, ctx: &Context, policy: PermissionPolicy) -> PermissionSummary {
    PermissionSummary {
        can_create: check_permission(config, Action::Create, ctx, policy),
        can_update: check_permission(config, Action::Update, ctx, policy),
        can_delete: check_permission(config, Action::Delete, ctx, policy),
    }
}

/// Fields the caller may not read or write for one action.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldPermissions {
    pub denied_read: BTreeSet<String>,
    pub denied_write: BTreeSet<String>,
}

/// `Some(allowed)` when the entry governs `key` (`read` or `write`).
fn field_flag(entry: &Value, key: &str) -> Option<bool> {
    match entry {
        Value::Bool(b) => Some(*b),
        Value::Object(m) => m.get(key).and_then(Value::as_bool),
        _ => None,
    }
}

impl FieldPermissions {
    /// Resolve field permissions from the caller's matching permission rows.
    /// A field without any entry is unrestricted.
    pub fn resolve(config: &EntityConfiguration, action: Action, ctx: &Context, policy: PermissionPolicy) -> Self {
        let roles = ctx.roles();
        let rows: Vec<&Map<String, Value>> = matching(config, action, &roles)
            .filter(|p| p.is_allowed)
            .map(|p| &p.field_permissions)
            .collect();
        let mut out = FieldPermissions::default();
        for key in ["read", "write"] {
            let mut grants = BTreeSet::new();
            let mut denies = BTreeSet::new();
            for fields in &rows {
                for (field, entry) in fields.iter() {
                    match field_flag(entry, key) {
                        Some(true) => {
                            grants.insert(field.clone());
                        }
                        Some(false) => {
                            denies.insert(field.clone());
                        }
                        None => {}
                    }
                }
            }
            let denied: BTreeSet<String> = match policy {
                PermissionPolicy::AnyAllow => denies.difference(&grants).cloned().collect(),
                PermissionPolicy::DenyOverrides => denies,
            };
            if key == "read" {
                out.denied_read = denied;
            } else {
                out.denied_write = denied;
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.denied_read.is_empty() && self.denied_write.is_empty()
    }

    /// Remove read-denied fields from a record.
    pub fn strip(&self, record: &mut Map<String, Value>) {
        for field in &self.denied_read {
            record.remove(field);
        }
    }

    /// One `forbidden_field` error per write-denied field present in `data`.
    pub fn check_writable(&self, data: &Map<String, Value>) -> Vec<FieldError> {
        data.keys()
            .filter(|k| self.denied_write.contains(*k))
            .map(|k| FieldError::new(k.clone(), "forbidden_field", format!("{} may not be written", k)))
            .collect()
    }
}
