//! Workflow dispatch. Conditions are evaluated here; actions are handed to a pluggable executor.

use crate::config::{Condition, EntityConfiguration, TriggerEvent, WorkflowDefinition};
use crate::context::Context;
use crate::error::EngineError;
use crate::sql::Operator;
use crate::storage::{compare_values, like_matches};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// What happened to a record, as seen by a workflow.
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowEvent {
    pub entity: String,
    pub trigger: TriggerEvent,
    /// Record after the change; for deletes, the record that was removed.
    pub record: Map<String, Value>,
    /// Record before an update or delete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Map<String, Value>>,
    pub changed_fields: Vec<String>,
    pub tenant: String,
    pub user_id: Option<String>,
}

/// Runs a workflow's actions. Side effects (email, webhooks, ...) live behind this trait.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute(&self, workflow: &WorkflowDefinition, event: &WorkflowEvent) -> Result<(), EngineError>;
}

/// Default executor: records each dispatched action in the log and does nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl WorkflowExecutor for LoggingExecutor {
    async fn execute(&self, workflow: &WorkflowDefinition, event: &WorkflowEvent) -> Result<(), EngineError> {
        for action in &workflow.actions {
            tracing::info!(
                entity = %event.entity,
                workflow = %workflow.name,
                trigger = %event.trigger,
                action = %action.get("type").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                "workflow action"
            );
        }
        Ok(())
    }
}

/// Keys whose value differs between `before` and `after`, in key order.
pub fn changed_fields(before: &Map<String, Value>, after: &Map<String, Value>) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(k, v)| before.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    changed.sort();
    changed
}

/// Whether every condition holds for `record`. Values may use context placeholders.
/// An unknown operator never matches.
pub fn conditions_match(conditions: &[Condition], record: &Map<String, Value>, ctx: &Context) -> bool {
    conditions.iter().all(|c| {
        let Ok(op) = c.op.parse::<Operator>() else {
            tracing::warn!(field = %c.field, op = %c.op, "unknown workflow condition operator");
            return false;
        };
        let actual = record.get(&c.field).unwrap_or(&Value::Null);
        evaluate(op, actual, &ctx.resolve_value(&c.value))
    })
}

fn evaluate(op: Operator, actual: &Value, expected: &Value) -> bool {
    let text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let list = || match expected {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    match op {
        Operator::Eq if expected.is_null() => actual.is_null(),
        Operator::Neq if expected.is_null() => !actual.is_null(),
        Operator::Eq => compare_values(actual, expected) == Some(Ordering::Equal),
        Operator::Neq => compare_values(actual, expected).is_some_and(|o| o != Ordering::Equal),
        Operator::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        Operator::Gte => compare_values(actual, expected).is_some_and(|o| o != Ordering::Less),
        Operator::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        Operator::Lte => compare_values(actual, expected).is_some_and(|o| o != Ordering::Greater),
        _ if actual.is_null() => false,
        Operator::Like => like_matches(&text(actual), &text(expected)),
        Operator::Contains => text(actual).to_lowercase().contains(&text(expected).to_lowercase()),
        Operator::StartsWith => text(actual).to_lowercase().starts_with(&text(expected).to_lowercase()),
        Operator::EndsWith => text(actual).to_lowercase().ends_with(&text(expected).to_lowercase()),
        Operator::In => list()
            .iter()
            .any(|v| compare_values(actual, v) == Some(Ordering::Equal)),
        Operator::Nin => !list()
            .iter()
            .any(|v| compare_values(actual, v) == Some(Ordering::Equal)),
    }
}

/// Whether `workflow` should run for `event`. `field_change` additionally needs a watched
/// field (one named by a condition, or any field without conditions) to have changed.
fn applies(workflow: &WorkflowDefinition, event: &WorkflowEvent, ctx: &Context) -> bool {
    if workflow.trigger_event == TriggerEvent::FieldChange {
        let watched = workflow.conditions.is_empty()
            || workflow
                .conditions
                .iter()
                .any(|c| event.changed_fields.contains(&c.field));
        if !watched || event.changed_fields.is_empty() {
            return false;
        }
    }
    conditions_match(&workflow.conditions, &event.record, ctx)
}

/// Run the entity's active workflows for `event.trigger` in order. Failures of blocking
/// (`before_*`) triggers abort with `EngineError::Workflow`; other failures are logged.
pub(crate) async fn dispatch(
    executor: &dyn WorkflowExecutor,
    config: &EntityConfiguration,
    event: &WorkflowEvent,
    ctx: &Context,
) -> Result<(), EngineError> {
    for workflow in config.workflows_for(event.trigger) {
        if !applies(workflow, event, ctx) {
            continue;
        }
        tracing::debug!(entity = %event.entity, workflow = %workflow.name, trigger = %event.trigger, "running workflow");
        let Err(err) = executor.execute(workflow, event).await else {
            continue;
        };
        if event.trigger.is_blocking() {
            return Err(match err {
                e @ EngineError::Workflow { .. } => e,
                other => EngineError::Workflow {
                    entity: event.entity.clone(),
                    trigger: event.trigger.to_string(),
                    message: other.to_string(),
                },
            });
        }
        tracing::warn!(entity = %event.entity, workflow = %workflow.name, trigger = %event.trigger, error = %err, "workflow failed");
    }
    Ok(())
}
