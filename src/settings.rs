//! Engine settings. Read from `ENTITY_ENGINE_*` environment variables (a `.env` file is honored); unset or invalid values fall back to defaults.

use crate::security::PermissionPolicy;
use crate::sql::{Dialect, Relation, SqlBuilder};
use crate::tenant::{TenantIsolation, TenantScope};
use std::str::FromStr;

pub const ENV_PREFIX: &str = "ENTITY_ENGINE_";

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Placeholder and quoting style for generated SQL.
    pub dialect: Dialect,
    /// Tenant id that means "no isolation".
    pub default_tenant: String,
    /// Column carrying the tenant id when isolation is by column.
    pub tenant_column: String,
    pub tenant_isolation: TenantIsolation,
    pub permission_policy: PermissionPolicy,
    /// When true, a caller with no matching RLS rule sees no rows.
    pub rls_default_deny: bool,
    /// How conditions from different RLS rules for the caller's roles combine.
    pub rls_rule_relation: Relation,
    pub cache_enabled: bool,
    pub default_page_size: u64,
    pub max_page_size: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            dialect: Dialect::Generic,
            default_tenant: "default".into(),
            tenant_column: "tenant_id".into(),
            tenant_isolation: TenantIsolation::Column,
            permission_policy: PermissionPolicy::AnyAllow,
            rls_default_deny: false,
            rls_rule_relation: Relation::And,
            cache_enabled: true,
            default_page_size: 20,
            max_page_size: 1000,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = EngineSettings::default();
        EngineSettings {
            dialect: env_parse("DIALECT", defaults.dialect),
            default_tenant: env_string("DEFAULT_TENANT").unwrap_or(defaults.default_tenant),
            tenant_column: env_string("TENANT_COLUMN").unwrap_or(defaults.tenant_column),
            tenant_isolation: env_parse("TENANT_ISOLATION", defaults.tenant_isolation),
            permission_policy: env_parse("PERMISSION_POLICY", defaults.permission_policy),
            rls_default_deny: env_parse_bool("RLS_DEFAULT_DENY", defaults.rls_default_deny),
            rls_rule_relation: env_parse("RLS_RULE_RELATION", defaults.rls_rule_relation),
            cache_enabled: env_parse_bool("CACHE_ENABLED", defaults.cache_enabled),
            default_page_size: env_parse("DEFAULT_PAGE_SIZE", defaults.default_page_size),
            max_page_size: env_parse("MAX_PAGE_SIZE", defaults.max_page_size),
        }
    }

    pub fn tenant_scope(&self) -> TenantScope {
        TenantScope::new(self.tenant_isolation, self.tenant_column.clone(), self.default_tenant.clone())
    }

    pub fn sql_builder(&self) -> SqlBuilder {
        SqlBuilder::new(self.dialect, self.tenant_scope())
    }

    /// Clamp a requested page size into `1..=max_page_size`.
    pub fn page_size(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            tracing::warn!(key = %format!("{}{}", ENV_PREFIX, key), value = %raw, error = %e, "invalid setting, using default");
            default
        }),
        None => default,
    }
}

fn env_parse_bool(key: &str, default: bool) -> bool {
    match env_string(key).map(|s| s.to_lowercase()) {
        Some(s) if matches!(s.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(s) if matches!(s.as_str(), "0" | "false" | "no" | "off") => false,
        Some(s) => {
            tracing::warn!(key = %format!("{}{}", ENV_PREFIX, key), value = %s, "invalid boolean setting, using default");
            default
        }
        None => default,
    }
}
