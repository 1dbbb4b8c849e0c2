mod common;

use async_trait::async_trait;
use common::{installed, record, Seed, ALL_ACTIONS};
use entity_engine::config::{
    Action, Condition, FieldDefinition, FieldType, PermissionDefinition, QueryConfig, RlsDefinition, TriggerEvent,
    ValidationRules, ViewDefinition, WorkflowDefinition,
};
use entity_engine::service::WorkflowEvent;
use entity_engine::sql::{Relation, SortSpec};
use entity_engine::{
    Context, EngineError, EngineSettings, EntityService, FindOptions, SyncOutcome, ViewOptions, WorkflowExecutor,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

async fn user_service() -> EntityService {
    let (storage, builder) = installed().await;
    let seed = Seed::entity(storage.as_ref(), &builder, "user", "users").await;
    seed.field(
        FieldDefinition::new(seed.id(), "email", FieldType::String)
            .required()
            .unique()
            .with_rules(ValidationRules {
                email: true,
                ..ValidationRules::default()
            }),
    )
    .await;
    seed.field(FieldDefinition::new(seed.id(), "name", FieldType::String)).await;
    seed.field(FieldDefinition::new(seed.id(), "role", FieldType::String).with_default(json!("member")))
        .await;
    seed.field(FieldDefinition::new(seed.id(), "profile", FieldType::Object)).await;
    seed.grant("admin", &ALL_ACTIONS).await;
    seed.grant("public", &[Action::Read]).await;
    let service = EntityService::new(storage.clone(), EngineSettings::default());
    service.sync_table("user", &admin()).await.unwrap();
    service
}

fn admin() -> Context {
    Context::for_user("admin-1", &["admin"])
}

fn field_codes(err: &EngineError) -> Vec<(String, String)> {
    match err {
        EngineError::Validation { errors, .. } => errors.iter().map(|e| (e.field.clone(), e.code.clone())).collect(),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_stamps_managed_columns_and_defaults() {
    let service = user_service().await;
    let created = service
        .create(
            "user",
            record(json!({ "email": "ada@example.com", "name": "Ada", "profile": { "lang": "en" } })),
            &admin(),
        )
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
    assert_eq!(created["role"], json!("member"));
    assert_eq!(created["created_by"], json!("admin-1"));
    assert!(created["created_at"].is_string());
    assert_eq!(created["profile"], json!({ "lang": "en" }));

    let fetched = service.find_by_id("user", id, &Context::anonymous()).await.unwrap();
    assert_eq!(fetched["email"], json!("ada@example.com"));
    assert_eq!(fetched["profile"], json!({ "lang": "en" }));
}

#[tokio::test]
async fn create_reports_every_field_error() {
    let service = user_service().await;
    let err = service
        .create("user", record(json!({ "name": 7 })), &admin())
        .await
        .unwrap_err();
    let codes = field_codes(&err);
    assert!(codes.contains(&("email".into(), "required".into())));
    assert!(codes.contains(&("name".into(), "invalid_type".into())));

    let err = service
        .create("user", record(json!({ "email": "not-an-email" })), &admin())
        .await
        .unwrap_err();
    assert_eq!(field_codes(&err), vec![("email".to_string(), "email".to_string())]);
}

#[tokio::test]
async fn unique_fields_are_enforced_on_create_and_update() {
    let service = user_service().await;
    let first = service
        .create("user", record(json!({ "email": "a@example.com" })), &admin())
        .await
        .unwrap();
    let second = service
        .create("user", record(json!({ "email": "b@example.com" })), &admin())
        .await
        .unwrap();

    let err = service
        .create("user", record(json!({ "email": "a@example.com" })), &admin())
        .await
        .unwrap_err();
    assert_eq!(field_codes(&err), vec![("email".to_string(), "unique".to_string())]);

    let second_id = second["id"].as_str().unwrap();
    let err = service
        .update("user", second_id, record(json!({ "email": "a@example.com" })), &admin())
        .await
        .unwrap_err();
    assert_eq!(field_codes(&err), vec![("email".to_string(), "unique".to_string())]);

    // Writing a record's own value back is not a conflict.
    let first_id = first["id"].as_str().unwrap();
    service
        .update("user", first_id, record(json!({ "email": "a@example.com", "name": "A" })), &admin())
        .await
        .unwrap();
}

#[tokio::test]
async fn permission_is_checked_before_any_data_access() {
    let (storage, builder) = installed().await;
    let seed = Seed::entity(storage.as_ref(), &builder, "note", "notes").await;
    seed.field(FieldDefinition::new(seed.id(), "body", FieldType::String)).await;
    seed.grant("admin", &ALL_ACTIONS).await;
    // The data table is never created: a denied caller must fail on permission, not storage.
    let service = EntityService::new(storage.clone(), EngineSettings::default());
    let guest = Context::anonymous();

    let err = service.create("note", record(json!({ "body": "x" })), &guest).await.unwrap_err();
    assert!(matches!(err, EngineError::Permission { action: Action::Create, .. }));
    let err = service.find("note", FindOptions::default(), &guest).await.unwrap_err();
    assert!(matches!(err, EngineError::Permission { action: Action::List, .. }));
    let err = service.delete("note", "n1", &guest).await.unwrap_err();
    assert!(matches!(err, EngineError::Permission { action: Action::Delete, .. }));
    assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);

    let err = service.find("note", FindOptions::default(), &admin()).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage { .. }));
}

#[tokio::test]
async fn unknown_entity_is_not_found() {
    let (storage, _) = installed().await;
    let service = EntityService::new(storage, EngineSettings::default());
    let err = service.find("ghost", FindOptions::default(), &admin()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { ref entity, id: None } if entity == "ghost"));
}

#[tokio::test]
async fn update_and_delete_missing_records() {
    let service = user_service().await;
    let err = service
        .update("user", "missing", record(json!({ "name": "x" })), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { id: Some(ref id), .. } if id == "missing"));
    let err = service.delete("user", "missing", &admin()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn update_is_partial_and_delete_removes() {
    let service = user_service().await;
    let created = service
        .create("user", record(json!({ "email": "c@example.com", "name": "C" })), &admin())
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let updated = service
        .update("user", &id, record(json!({ "name": "Cee", "bogus": 1 })), &admin())
        .await
        .unwrap();
    assert_eq!(updated["name"], json!("Cee"));
    assert_eq!(updated["email"], json!("c@example.com"));
    assert!(!updated.contains_key("bogus"));
    assert_eq!(updated["created_at"], created["created_at"]);

    let err = service
        .update("user", &id, record(json!({ "email": null })), &admin())
        .await
        .unwrap_err();
    assert_eq!(field_codes(&err), vec![("email".to_string(), "required".to_string())]);

    service.delete("user", &id, &admin()).await.unwrap();
    assert!(matches!(
        service.find_by_id("user", &id, &admin()).await,
        Err(EngineError::NotFound { .. })
    ));
    assert_eq!(service.count("user", &Value::Null, &admin()).await.unwrap(), 0);
}

#[tokio::test]
async fn find_filters_sorts_and_counts() {
    let service = user_service().await;
    for (email, name) in [("z@x.io", "Zed"), ("a@x.io", "Amy"), ("m@x.io", "Mo")] {
        service
            .create("user", record(json!({ "email": email, "name": name })), &admin())
            .await
            .unwrap();
    }
    let result = service
        .find(
            "user",
            FindOptions {
                sort: vec![SortSpec::desc("name")],
                fields: Some(vec!["name".into()]),
                ..FindOptions::default()
            },
            &admin(),
        )
        .await
        .unwrap();
    let names: Vec<&Value> = result.data.iter().map(|r| &r["name"]).collect();
    assert_eq!(names, vec![&json!("Zed"), &json!("Mo"), &json!("Amy")]);
    assert!(result.data.iter().all(|r| r.len() == 1));
    assert_eq!(result.meta.total, 3);

    let filtered = service
        .find(
            "user",
            FindOptions {
                filters: json!([{ "field": "name", "operator": "startswith", "value": "a" }]),
                ..FindOptions::default()
            },
            &admin(),
        )
        .await
        .unwrap();
    assert_eq!(filtered.data.len(), 1);
    assert_eq!(service.count("user", &json!({ "name": "Mo" }), &admin()).await.unwrap(), 1);
}

#[tokio::test]
async fn read_denied_fields_are_stripped_and_write_denied_rejected() {
    let (storage, builder) = installed().await;
    let seed = Seed::entity(storage.as_ref(), &builder, "employee", "employees").await;
    seed.field(FieldDefinition::new(seed.id(), "name", FieldType::String)).await;
    seed.field(FieldDefinition::new(seed.id(), "salary", FieldType::Number)).await;
    seed.grant("hr", &ALL_ACTIONS).await;
    let hidden = json!({ "salary": { "read": false, "write": false } }).as_object().cloned().unwrap();
    for action in [Action::Read, Action::List, Action::Create] {
        seed.permission(PermissionDefinition::allow(seed.id(), "staff", action).with_field_permissions(hidden.clone()))
            .await;
    }
    let service = EntityService::new(storage.clone(), EngineSettings::default());
    let hr = Context::for_user("h", &["hr"]);
    let staff = Context::for_user("s", &["staff"]);
    service.sync_table("employee", &hr).await.unwrap();

    let created = service
        .create("employee", record(json!({ "name": "Eve", "salary": 100 })), &hr)
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap();
    assert_eq!(created["salary"], json!(100));

    let seen = service.find_by_id("employee", id, &staff).await.unwrap();
    assert!(!seen.contains_key("salary"));
    let listed = service.find("employee", FindOptions::default(), &staff).await.unwrap();
    assert!(listed.data.iter().all(|r| !r.contains_key("salary")));

    let err = service
        .create("employee", record(json!({ "name": "Mal", "salary": 1 })), &staff)
        .await
        .unwrap_err();
    assert_eq!(field_codes(&err), vec![("salary".to_string(), "forbidden_field".to_string())]);
}

async fn ticket_service(relation: Relation) -> EntityService {
    let (storage, builder) = installed().await;
    let seed = Seed::entity(storage.as_ref(), &builder, "ticket", "tickets").await;
    seed.field(FieldDefinition::new(seed.id(), "title", FieldType::String)).await;
    seed.field(FieldDefinition::new(seed.id(), "status", FieldType::String)).await;
    seed.field(FieldDefinition::new(seed.id(), "owner_id", FieldType::String).with_default(json!("currentUser.id")))
        .await;
    seed.grant("member", &ALL_ACTIONS).await;
    seed.rls(RlsDefinition::new(
        seed.id(),
        "member",
        relation,
        vec![
            Condition::new("owner_id", "eq", "currentUser.id"),
            Condition::new("status", "eq", "public"),
        ],
    ))
    .await;
    let service = EntityService::new(storage.clone(), EngineSettings::default());
    let alice = Context::for_user("alice", &["member"]);
    let bob = Context::for_user("bob", &["member"]);
    service.sync_table("ticket", &alice).await.unwrap();
    for (ctx, title, status) in [
        (&alice, "a-private", "private"),
        (&alice, "a-public", "public"),
        (&bob, "b-private", "private"),
        (&bob, "b-public", "public"),
    ] {
        service
            .create("ticket", record(json!({ "title": title, "status": status })), ctx)
            .await
            .unwrap();
    }
    service
}

async fn visible_titles(service: &EntityService, ctx: &Context) -> Vec<String> {
    let result = service
        .find(
            "ticket",
            FindOptions {
                sort: vec![SortSpec::asc("title")],
                ..FindOptions::default()
            },
            ctx,
        )
        .await
        .unwrap();
    result
        .data
        .iter()
        .map(|r| r["title"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn rls_or_rule_shows_own_and_public_rows() {
    let service = ticket_service(Relation::Or).await;
    let alice = Context::for_user("alice", &["member"]);
    assert_eq!(visible_titles(&service, &alice).await, vec!["a-private", "a-public", "b-public"]);
    assert_eq!(service.count("ticket", &Value::Null, &alice).await.unwrap(), 3);
}

#[tokio::test]
async fn rls_and_rule_requires_every_condition() {
    let service = ticket_service(Relation::And).await;
    let alice = Context::for_user("alice", &["member"]);
    assert_eq!(visible_titles(&service, &alice).await, vec!["a-public"]);
}

#[tokio::test]
async fn rls_hides_rows_from_read_update_and_delete() {
    let service = ticket_service(Relation::And).await;
    let bob = Context::for_user("bob", &["member"]);
    let bob_public = service
        .find("ticket", FindOptions::default(), &bob)
        .await
        .unwrap()
        .data
        .remove(0);
    let id = bob_public["id"].as_str().unwrap();

    let alice = Context::for_user("alice", &["member"]);
    assert!(matches!(service.find_by_id("ticket", id, &alice).await, Err(EngineError::NotFound { .. })));
    assert!(matches!(
        service.update("ticket", id, record(json!({ "title": "hijack" })), &alice).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(service.delete("ticket", id, &alice).await, Err(EngineError::NotFound { .. })));
    assert_eq!(service.find_by_id("ticket", id, &bob).await.unwrap()["title"], json!("b-public"));
}

#[tokio::test]
async fn update_that_moves_a_row_out_of_view_is_not_found() {
    let service = ticket_service(Relation::Or).await;
    let alice = Context::for_user("alice", &["member"]);
    let bob = Context::for_user("bob", &["member"]);
    let mine = service
        .find("ticket", FindOptions::default(), &alice)
        .await
        .unwrap()
        .data
        .into_iter()
        .find(|r| r["title"] == json!("a-private"))
        .unwrap();
    let id = mine["id"].as_str().unwrap();

    let err = service
        .update("ticket", id, record(json!({ "owner_id": "bob" })), &alice)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
    assert!(!visible_titles(&service, &alice).await.contains(&"a-private".to_string()));
    assert_eq!(service.find_by_id("ticket", id, &bob).await.unwrap()["owner_id"], json!("bob"));
}

#[tokio::test]
async fn owner_rule_hides_unowned_rows_from_anonymous_callers() {
    let (storage, builder) = installed().await;
    let seed = Seed::entity(storage.as_ref(), &builder, "note", "notes").await;
    seed.field(FieldDefinition::new(seed.id(), "title", FieldType::String)).await;
    seed.field(FieldDefinition::new(seed.id(), "owner_id", FieldType::String)).await;
    seed.grant("admin", &ALL_ACTIONS).await;
    seed.grant("public", &[Action::Read, Action::List]).await;
    seed.rls(RlsDefinition::new(
        seed.id(),
        "public",
        Relation::And,
        vec![Condition::new("owner_id", "eq", "currentUser.id")],
    ))
    .await;
    let service = EntityService::new(storage.clone(), EngineSettings::default());
    service.sync_table("note", &admin()).await.unwrap();
    let unowned = service
        .create("note", record(json!({ "title": "unowned secret" })), &admin())
        .await
        .unwrap();
    service
        .create("note", record(json!({ "title": "mine", "owner_id": "u-7" })), &admin())
        .await
        .unwrap();

    let anonymous = Context::anonymous();
    let seen = service.find("note", FindOptions::default(), &anonymous).await.unwrap();
    assert_eq!(seen.meta.total, 0);
    assert!(seen.data.is_empty());
    assert_eq!(service.count("note", &Value::Null, &anonymous).await.unwrap(), 0);
    let id = unowned["id"].as_str().unwrap();
    assert!(matches!(service.find_by_id("note", id, &anonymous).await, Err(EngineError::NotFound { .. })));

    let owner = Context::for_user("u-7", &[]);
    let seen = service.find("note", FindOptions::default(), &owner).await.unwrap();
    assert_eq!(seen.data.len(), 1);
    assert_eq!(seen.data[0]["title"], json!("mine"));
}

#[tokio::test]
async fn tenants_only_see_their_own_rows() {
    let service = user_service().await;
    let acme = admin().with_tenant("acme");
    let globex = admin().with_tenant("globex");
    let created = service
        .create("user", record(json!({ "email": "a@acme.io" })), &acme)
        .await
        .unwrap();
    assert_eq!(created["tenant_id"], json!("acme"));
    service
        .create("user", record(json!({ "email": "g@globex.io" })), &globex)
        .await
        .unwrap();
    // Unique checks are per tenant.
    service
        .create("user", record(json!({ "email": "a@acme.io" })), &globex)
        .await
        .unwrap();

    assert_eq!(service.count("user", &Value::Null, &acme).await.unwrap(), 1);
    assert_eq!(service.count("user", &Value::Null, &globex).await.unwrap(), 2);
    let id = created["id"].as_str().unwrap();
    assert!(matches!(service.find_by_id("user", id, &globex).await, Err(EngineError::NotFound { .. })));
    assert!(matches!(service.delete("user", id, &globex).await, Err(EngineError::NotFound { .. })));
    service.delete("user", id, &acme).await.unwrap();
}

#[tokio::test]
async fn sync_table_reports_existing_table() {
    let service = user_service().await;
    assert_eq!(
        service.sync_table("user", &admin()).await.unwrap(),
        SyncOutcome::Existing { missing: vec![] }
    );
}

#[tokio::test]
async fn sync_table_requires_create_permission() {
    let service = user_service().await;
    let err = service.sync_table("user", &Context::anonymous()).await.unwrap_err();
    assert!(matches!(err, EngineError::Permission { action: Action::Create, .. }));
}

#[tokio::test]
async fn supplied_id_must_be_unique() {
    let service = user_service().await;
    service
        .create("user", record(json!({ "id": "same", "email": "one@example.com" })), &admin())
        .await
        .unwrap();
    let err = service
        .create("user", record(json!({ "id": "same", "email": "two@example.com" })), &admin())
        .await
        .unwrap_err();
    assert_eq!(field_codes(&err), vec![("id".to_string(), "unique".to_string())]);
    assert_eq!(service.count("user", &Value::Null, &admin()).await.unwrap(), 1);
    assert_eq!(
        service.find_by_id("user", "same", &admin()).await.unwrap()["email"],
        json!("one@example.com")
    );
}

async fn catalog_service() -> EntityService {
    let (storage, builder) = installed().await;
    let item = Seed::entity(storage.as_ref(), &builder, "item", "items").await;
    item.field(FieldDefinition::new(item.id(), "name", FieldType::String)).await;
    item.field(FieldDefinition::new(item.id(), "seq", FieldType::Integer)).await;
    item.field(FieldDefinition::new(item.id(), "kind", FieldType::String)).await;
    item.grant("staff", &ALL_ACTIONS).await;
    item.view(ViewDefinition::new(
        item.id(),
        "paged",
        QueryConfig {
            sorting: vec![SortSpec::asc("seq")],
            pagination: serde_json::from_value(json!({ "per_page": 10 })).unwrap(),
            ..QueryConfig::default()
        },
    ))
    .await;
    let mut gadgets = ViewDefinition::new(
        item.id(),
        "gadgets",
        QueryConfig {
            filters: json!({ "kind": "gadget" }),
            sorting: vec![SortSpec::desc("seq")],
            ..QueryConfig::default()
        },
    );
    gadgets.fields = vec!["name".into(), "seq".into()];
    gadgets.is_public = true;
    item.view(gadgets).await;

    let service = EntityService::new(storage.clone(), EngineSettings::default());
    let staff = Context::for_user("s", &["staff"]);
    service.sync_table("item", &staff).await.unwrap();
    for seq in 1..=25 {
        let kind = if seq % 5 == 0 { "gadget" } else { "widget" };
        service
            .create("item", record(json!({ "name": format!("item-{seq}"), "seq": seq, "kind": kind })), &staff)
            .await
            .unwrap();
    }
    service
}

#[tokio::test]
async fn view_pagination_reports_has_more() {
    let service = catalog_service().await;
    let staff = Context::for_user("s", &["staff"]);
    let page = |n: u64| ViewOptions {
        page: Some(n),
        ..ViewOptions::default()
    };

    let second = service.find_by_view("item", "paged", page(2), &staff).await.unwrap();
    assert_eq!(second.data.len(), 10);
    assert_eq!(second.data[0]["seq"], json!(11));
    assert_eq!((second.meta.total, second.meta.per_page, second.meta.has_more), (25, 10, true));

    let third = service.find_by_view("item", "paged", page(3), &staff).await.unwrap();
    assert_eq!(third.data.len(), 5);
    assert!(!third.meta.has_more);
    assert!(third.permissions.can_create && third.permissions.can_delete);

    let custom = service
        .find_by_view(
            "item",
            "paged",
            ViewOptions {
                per_page: Some(4),
                sort_by: Some("seq".into()),
                sort_dir: Some("desc".into()),
                ..ViewOptions::default()
            },
            &staff,
        )
        .await
        .unwrap();
    assert_eq!(custom.data.len(), 4);
    assert_eq!(custom.data[0]["seq"], json!(25));
}

#[tokio::test]
async fn view_filters_projection_and_public_access() {
    let service = catalog_service().await;
    let guest = Context::anonymous();
    let result = service
        .find_by_view("item", "gadgets", ViewOptions::default(), &guest)
        .await
        .unwrap();
    assert_eq!(result.meta.total, 5);
    assert_eq!(result.data[0], record(json!({ "name": "item-25", "seq": 25 })));
    assert!(!result.permissions.can_create);

    let narrowed = service
        .find_by_view(
            "item",
            "gadgets",
            ViewOptions {
                filters: json!([{ "field": "seq", "operator": "lte", "value": 10 }]),
                ..ViewOptions::default()
            },
            &guest,
        )
        .await
        .unwrap();
    assert_eq!(narrowed.meta.total, 2);

    let err = service
        .find_by_view("item", "paged", ViewOptions::default(), &guest)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Permission { .. }));
    let err = service
        .find_by_view("item", "nope", ViewOptions::default(), &guest)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn view_joins_attach_related_records() {
    let (storage, builder) = installed().await;
    let author = Seed::entity(storage.as_ref(), &builder, "author", "authors").await;
    author.field(FieldDefinition::new(author.id(), "name", FieldType::String)).await;
    author.grant("editor", &ALL_ACTIONS).await;
    author
        .view(ViewDefinition::new(
            author.id(),
            "with_books",
            serde_json::from_value(json!({
                "joins": [{ "entity": "book", "local_field": "id", "foreign_field": "author_id",
                            "alias": "books", "type": "many", "fields": ["title"] }],
                "sorting": [{ "field": "name" }]
            }))
            .unwrap(),
        ))
        .await;
    let book = Seed::entity(storage.as_ref(), &builder, "book", "books").await;
    book.field(FieldDefinition::new(book.id(), "title", FieldType::String)).await;
    book.field(FieldDefinition::new(book.id(), "author_id", FieldType::Reference)).await;
    book.grant("editor", &ALL_ACTIONS).await;
    book.view(ViewDefinition::new(
        book.id(),
        "with_author",
        serde_json::from_value(json!({
            "joins": [{ "entity": "author", "local_field": "author_id", "alias": "author", "fields": ["name"] }],
            "sorting": [{ "field": "title" }]
        }))
        .unwrap(),
    ))
    .await;

    let service = EntityService::new(storage.clone(), EngineSettings::default());
    let editor = Context::for_user("e", &["editor"]);
    service.sync_table("author", &editor).await.unwrap();
    service.sync_table("book", &editor).await.unwrap();
    let le_guin = service
        .create("author", record(json!({ "id": "a1", "name": "Le Guin" })), &editor)
        .await
        .unwrap();
    assert_eq!(le_guin["id"], json!("a1"));
    service
        .create("author", record(json!({ "id": "a2", "name": "Banks" })), &editor)
        .await
        .unwrap();
    for (title, author_id) in [("Dispossessed", Some("a1")), ("Earthsea", Some("a1")), ("Orphan", None)] {
        service
            .create("book", record(json!({ "title": title, "author_id": author_id })), &editor)
            .await
            .unwrap();
    }

    let books = service
        .find_by_view("book", "with_author", ViewOptions::default(), &editor)
        .await
        .unwrap();
    assert_eq!(books.data[0]["author"], json!({ "name": "Le Guin" }));
    assert_eq!(books.data[2]["title"], json!("Orphan"));
    assert_eq!(books.data[2]["author"], Value::Null);

    let authors = service
        .find_by_view("author", "with_books", ViewOptions::default(), &editor)
        .await
        .unwrap();
    assert_eq!(authors.data[0]["name"], json!("Banks"));
    assert_eq!(authors.data[0]["books"], json!([]));
    let titles = authors.data[1]["books"].as_array().unwrap();
    assert_eq!(titles.len(), 2);
    assert!(titles.contains(&json!({ "title": "Earthsea" })));
}

#[tokio::test]
async fn joins_into_unreadable_entities_attach_nothing() {
    let (storage, builder) = installed().await;
    let author = Seed::entity(storage.as_ref(), &builder, "author", "authors").await;
    author.field(FieldDefinition::new(author.id(), "name", FieldType::String)).await;
    author.grant("editor", &ALL_ACTIONS).await;
    author.grant("reader", &[Action::List]).await;
    author
        .view(ViewDefinition::new(
            author.id(),
            "with_books",
            serde_json::from_value(json!({
                "joins": [{ "entity": "book", "local_field": "id", "foreign_field": "author_id",
                            "alias": "books", "type": "many" }]
            }))
            .unwrap(),
        ))
        .await;
    let book = Seed::entity(storage.as_ref(), &builder, "book", "books").await;
    book.field(FieldDefinition::new(book.id(), "title", FieldType::String)).await;
    book.field(FieldDefinition::new(book.id(), "author_id", FieldType::Reference)).await;
    book.grant("editor", &ALL_ACTIONS).await;
    book.grant("reader", &[Action::List]).await;
    book.view(ViewDefinition::new(
        book.id(),
        "with_author",
        serde_json::from_value(json!({
            "joins": [{ "entity": "author", "local_field": "author_id", "alias": "author" }]
        }))
        .unwrap(),
    ))
    .await;

    let service = EntityService::new(storage.clone(), EngineSettings::default());
    let editor = Context::for_user("e", &["editor"]);
    service.sync_table("author", &editor).await.unwrap();
    service.sync_table("book", &editor).await.unwrap();
    service
        .create("author", record(json!({ "id": "a1", "name": "Le Guin" })), &editor)
        .await
        .unwrap();
    service
        .create("book", record(json!({ "title": "Earthsea", "author_id": "a1" })), &editor)
        .await
        .unwrap();

    let reader = Context::for_user("r", &["reader"]);
    let authors = service
        .find_by_view("author", "with_books", ViewOptions::default(), &reader)
        .await
        .unwrap();
    assert_eq!(authors.data[0]["name"], json!("Le Guin"));
    assert_eq!(authors.data[0]["books"], json!([]));
    let books = service
        .find_by_view("book", "with_author", ViewOptions::default(), &reader)
        .await
        .unwrap();
    assert_eq!(books.data[0]["author"], Value::Null);

    let books = service
        .find_by_view("book", "with_author", ViewOptions::default(), &editor)
        .await
        .unwrap();
    assert_eq!(books.data[0]["author"]["name"], json!("Le Guin"));
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, TriggerEvent, Vec<String>)>>,
    reject: Option<&'static str>,
}

#[async_trait]
impl WorkflowExecutor for Recorder {
    async fn execute(&self, workflow: &WorkflowDefinition, event: &WorkflowEvent) -> Result<(), EngineError> {
        self.events
            .lock()
            .unwrap()
            .push((workflow.name.clone(), event.trigger, event.changed_fields.clone()));
        if self.reject == Some(workflow.name.as_str()) {
            return Err(EngineError::QueryBuild(format!("{} refused", workflow.name)));
        }
        Ok(())
    }
}

async fn order_service(recorder: Arc<Recorder>) -> EntityService {
    let (storage, builder) = installed().await;
    let seed = Seed::entity(storage.as_ref(), &builder, "order", "orders").await;
    seed.field(FieldDefinition::new(seed.id(), "status", FieldType::String)).await;
    seed.field(FieldDefinition::new(seed.id(), "total", FieldType::Number)).await;
    seed.grant("clerk", &ALL_ACTIONS).await;
    seed.workflow(
        WorkflowDefinition::new(seed.id(), "big_orders", TriggerEvent::BeforeCreate)
            .with_conditions(vec![Condition::new("total", "gt", 1000)]),
    )
    .await;
    seed.workflow(WorkflowDefinition::new(seed.id(), "created", TriggerEvent::AfterCreate)).await;
    seed.workflow(
        WorkflowDefinition::new(seed.id(), "shipped", TriggerEvent::FieldChange)
            .with_conditions(vec![Condition::new("status", "eq", "shipped")]),
    )
    .await;
    seed.workflow(WorkflowDefinition::new(seed.id(), "removed", TriggerEvent::AfterDelete)).await;
    let service = EntityService::new(storage.clone(), EngineSettings::default()).with_executor(recorder);
    service.sync_table("order", &clerk()).await.unwrap();
    service
}

fn clerk() -> Context {
    Context::for_user("c", &["clerk"])
}

#[tokio::test]
async fn workflows_run_for_lifecycle_events() {
    let recorder = Arc::new(Recorder::default());
    let service = order_service(recorder.clone()).await;
    let order = service
        .create("order", record(json!({ "status": "new", "total": 50 })), &clerk())
        .await
        .unwrap();
    let id = order["id"].as_str().unwrap();
    service
        .update("order", id, record(json!({ "total": 60 })), &clerk())
        .await
        .unwrap();
    service
        .update("order", id, record(json!({ "status": "shipped" })), &clerk())
        .await
        .unwrap();
    service.delete("order", id, &clerk()).await.unwrap();

    let events = recorder.events.lock().unwrap().clone();
    let names: Vec<&str> = events.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(names, vec!["created", "shipped", "removed"]);
    assert_eq!(events[1].2, vec!["status".to_string()]);
}

#[tokio::test]
async fn failing_before_workflow_aborts_the_write() {
    let recorder = Arc::new(Recorder {
        reject: Some("big_orders"),
        ..Recorder::default()
    });
    let service = order_service(recorder.clone()).await;
    let err = service
        .create("order", record(json!({ "status": "new", "total": 5000 })), &clerk())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Workflow { ref trigger, .. } if trigger == "before_create"));
    assert_eq!(service.count("order", &Value::Null, &clerk()).await.unwrap(), 0);

    service
        .create("order", record(json!({ "status": "new", "total": 10 })), &clerk())
        .await
        .unwrap();
    assert_eq!(service.count("order", &Value::Null, &clerk()).await.unwrap(), 1);
}
