//! Row-level security: turn the caller's RLS rules into predicates.
//!
//! Without a matching rule the caller is unrestricted unless `rls_default_deny` is set.

use crate::config::{Condition, EntityConfiguration};
use crate::context::Context;
use crate::settings::EngineSettings;
use crate::sql::{Filter, Operator, Predicate, Relation};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Normalized conditions of one stored rule.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RlsRule {
    pub role: String,
    pub relation: Relation,
    pub conditions: Vec<Filter>,
    /// Set when a condition could not be interpreted; the rule then matches nothing.
    pub unsatisfiable: bool,
}

impl RlsRule {
    pub fn to_predicate(&self) -> Predicate {
        if self.unsatisfiable {
            return Predicate::Constant(false);
        }
        Predicate::Group {
            relation: self.relation,
            predicates: self.conditions.iter().cloned().map(Predicate::from).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RlsFilter {
    pub rules: Vec<RlsRule>,
    /// How rules combine with each other.
    pub relation: Relation,
    /// No rule matched and default-deny is on.
    pub deny_all: bool,
}

impl RlsFilter {
    pub fn is_unrestricted(&self) -> bool {
        !self.deny_all && self.rules.is_empty()
    }

    /// All conditions across rules, in rule order.
    pub fn conditions(&self) -> Vec<&Filter> {
        self.rules.iter().flat_map(|r| r.conditions.iter()).collect()
    }

    /// Predicate to AND into every read, update and delete; `None` when unrestricted.
    pub fn to_predicate(&self) -> Option<Predicate> {
        if self.deny_all {
            return Some(Predicate::Constant(false));
        }
        match self.rules.as_slice() {
            [] => None,
            [only] => Some(only.to_predicate()),
            rules => Some(Predicate::Group {
                relation: self.relation,
                predicates: rules.iter().map(RlsRule::to_predicate).collect(),
            }),
        }
    }
}

/// Build the caller's RLS restriction. Rules are taken in stored order; placeholders are
/// resolved against `ctx`; exposed conditions take their value from `inputs[field]` when given.
/// A rule whose placeholder resolves to nothing (anonymous `currentUser.id`, a missing
/// `$context` path) matches no rows.
pub fn build_rls_conditions(
    config: &EntityConfiguration,
    ctx: &Context,
    inputs: &Map<String, Value>,
    settings: &EngineSettings,
) -> RlsFilter {
    let roles = ctx.roles();
    let rules: Vec<RlsRule> = config
        .rls
        .iter()
        .filter(|r| r.is_active && roles.iter().any(|role| *role == r.role))
        .map(|r| {
            let mut unsatisfiable = false;
            let conditions = r
                .rls_config
                .conditions
                .iter()
                .filter_map(|c| match normalize(c, ctx, inputs) {
                    Ok(f) => Some(f),
                    Err(reason) => {
                        tracing::warn!(entity = %config.name(), rule = %r.id, field = %c.field, op = %c.op, %reason, "rls rule denies all rows");
                        unsatisfiable = true;
                        None
                    }
                })
                .collect();
            RlsRule {
                role: r.role.clone(),
                relation: r.rls_config.relation,
                conditions,
                unsatisfiable,
            }
        })
        .collect();
    RlsFilter {
        deny_all: rules.is_empty() && settings.rls_default_deny,
        rules,
        relation: settings.rls_rule_relation,
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
enum Unsatisfiable {
    #[error("unknown operator")]
    UnknownOperator,
    #[error("placeholder has no value in context")]
    UnresolvedPlaceholder,
}

fn normalize(c: &Condition, ctx: &Context, inputs: &Map<String, Value>) -> Result<Filter, Unsatisfiable> {
    let operator: Operator = c.op.parse().map_err(|_| Unsatisfiable::UnknownOperator)?;
    let value = match inputs.get(&c.field) {
        Some(v) if c.exposed => v.clone(),
        _ => {
            if has_unresolved_placeholder(&c.value, ctx) {
                return Err(Unsatisfiable::UnresolvedPlaceholder);
            }
            ctx.resolve_value(&c.value)
        }
    };
    Ok(Filter::new(c.field.clone(), operator, value))
}

/// A placeholder whose context path is missing would otherwise compare against `null`.
fn has_unresolved_placeholder(value: &Value, ctx: &Context) -> bool {
    match value {
        Value::String(s) => ctx.resolve_placeholder(s).is_some_and(|v| v.is_null()),
        Value::Array(items) => items.iter().any(|v| has_unresolved_placeholder(v, ctx)),
        _ => false,
    }
}
