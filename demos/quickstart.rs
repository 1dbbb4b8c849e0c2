//! In-memory walkthrough: install system tables, define a `task` entity, then create,
//! update, list and query it through a view. Run with `RUST_LOG=entity_engine=debug` to see the SQL.

use entity_engine::config::{
    Action, Condition, EntityDefinition, FieldDefinition, FieldType, PermissionDefinition, QueryConfig,
    RlsDefinition, ValidationRules, ViewDefinition,
};
use entity_engine::sql::{Relation, SortSpec};
use entity_engine::storage::{MemoryStorage, StorageAdapter};
use entity_engine::{store, Context, EngineError, EngineSettings, EntityService, FindOptions, ViewOptions};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("entity_engine=info".parse()?))
        .init();

    let settings = EngineSettings::from_env();
    let storage = Arc::new(MemoryStorage::new());
    storage.connect().await?;
    let builder = settings.sql_builder();
    store::ensure_system_tables(storage.as_ref(), &builder).await?;

    let entity = EntityDefinition::new("task-entity", "task", "tasks");
    let title = FieldDefinition::new(&entity.id, "title", FieldType::String)
        .required()
        .with_rules(ValidationRules {
            min_length: Some(3),
            ..ValidationRules::default()
        });
    let status = FieldDefinition::new(&entity.id, "status", FieldType::String).with_default(json!("open"));
    let owner = FieldDefinition::new(&entity.id, "owner_id", FieldType::String).with_default(json!("currentUser.id"));
    let open_view = ViewDefinition::new(
        &entity.id,
        "open",
        QueryConfig {
            filters: json!({ "status": "open" }),
            sorting: vec![SortSpec::asc("title")],
            ..QueryConfig::default()
        },
    );

    let s: &dyn StorageAdapter = storage.as_ref();
    store::insert_entity(s, &builder, &entity).await?;
    for field in [&title, &status, &owner] {
        store::insert_field(s, &builder, field).await?;
    }
    for action in [Action::Create, Action::Read, Action::Update, Action::Delete, Action::List] {
        store::insert_permission(s, &builder, &PermissionDefinition::allow(&entity.id, "member", action)).await?;
    }
    store::insert_rls(
        s,
        &builder,
        &RlsDefinition::new(
            &entity.id,
            "member",
            Relation::And,
            vec![Condition::new("owner_id", "eq", "currentUser.id")],
        ),
    )
    .await?;
    store::insert_view(s, &builder, &open_view).await?;

    let service = EntityService::new(storage.clone(), settings);
    let alice = Context::for_user("alice", &["member"]);
    let bob = Context::for_user("bob", &["member"]);
    service.sync_table("task", &alice).await?;

    let first = service
        .create("task", json!({ "title": "Write docs" }).as_object().cloned().unwrap_or_default(), &alice)
        .await?;
    service
        .create("task", json!({ "title": "Fix build" }).as_object().cloned().unwrap_or_default(), &alice)
        .await?;
    service
        .create("task", json!({ "title": "Plan sprint" }).as_object().cloned().unwrap_or_default(), &bob)
        .await?;
    tracing::info!(record = %serde_json::to_string(&first)?, "created");

    if let Err(e) = service
        .create("task", json!({ "title": "x" }).as_object().cloned().unwrap_or_default(), &alice)
        .await
    {
        tracing::info!(code = e.code(), error = %e, "rejected");
    }

    let id = first.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    service
        .update("task", &id, json!({ "status": "done" }).as_object().cloned().unwrap_or_default(), &alice)
        .await?;

    let mine = service.find("task", FindOptions::default(), &alice).await?;
    tracing::info!(total = mine.meta.total, "alice sees her own tasks");
    let open = service.find_by_view("task", "open", ViewOptions::default(), &alice).await?;
    println!("{}", serde_json::to_string_pretty(&open)?);

    match service.find_by_id("task", &id, &bob).await {
        Err(EngineError::NotFound { .. }) => tracing::info!("bob cannot see alice's task"),
        other => tracing::warn!(result = ?other, "unexpected visibility"),
    }
    Ok(())
}
