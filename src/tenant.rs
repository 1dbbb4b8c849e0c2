//! Tenant isolation: how a tenant id turns into a row predicate or a physical table name.

use crate::error::EngineError;
use crate::sql::{is_valid_identifier, Filter};

/// Tenant isolation strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TenantIsolation {
    /// Tenants share tables; rows carry a tenant column and every statement filters on it.
    Column,
    /// Each tenant has its own physical tables named `<tenant>_<table>`.
    TablePrefix,
}

impl std::str::FromStr for TenantIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "column" => Ok(TenantIsolation::Column),
            "table_prefix" | "prefix" => Ok(TenantIsolation::TablePrefix),
            _ => Err(format!(
                "invalid tenant isolation: {} (expected column or table_prefix)",
                s
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TenantScope {
    pub isolation: TenantIsolation,
    pub column: String,
    pub default_tenant: String,
}

impl TenantScope {
    pub fn new(isolation: TenantIsolation, column: impl Into<String>, default_tenant: impl Into<String>) -> Self {
        TenantScope {
            isolation,
            column: column.into(),
            default_tenant: default_tenant.into(),
        }
    }

    pub fn is_default(&self, tenant: &str) -> bool {
        tenant == self.default_tenant
    }

    /// Table to address for `tenant`. Schema-qualified names keep their schema.
    pub fn physical_table(&self, table: &str, tenant: &str) -> Result<String, EngineError> {
        if self.isolation != TenantIsolation::TablePrefix || self.is_default(tenant) {
            return Ok(table.to_string());
        }
        if !is_valid_identifier(tenant) || tenant.contains('.') {
            return Err(EngineError::QueryBuild(format!("invalid tenant id '{}'", tenant)));
        }
        Ok(match table.rsplit_once('.') {
            Some((schema, name)) => format!("{}.{}_{}", schema, tenant, name),
            None => format!("{}_{}", tenant, table),
        })
    }

    /// Implicit tenant predicate, present only for column isolation and a non-default tenant.
    pub fn tenant_filter(&self, tenant: &str) -> Option<Filter> {
        if self.isolation == TenantIsolation::Column && !self.is_default(tenant) {
            Some(Filter::eq(self.column.clone(), tenant))
        } else {
            None
        }
    }
}

impl Default for TenantScope {
    fn default() -> Self {
        TenantScope::new(TenantIsolation::Column, "tenant_id", "default")
    }
}
