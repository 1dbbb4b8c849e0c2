#![allow(dead_code)]

use entity_engine::config::{
    Action, EntityDefinition, FieldDefinition, PermissionDefinition, RlsDefinition, ViewDefinition, WorkflowDefinition,
};
use entity_engine::storage::{MemoryStorage, StorageAdapter};
use entity_engine::{store, EngineSettings, Record, SqlBuilder};
use serde_json::Value;
use std::sync::Arc;

/// Connected in-memory storage with system tables installed.
pub async fn installed() -> (Arc<MemoryStorage>, SqlBuilder) {
    let storage = Arc::new(MemoryStorage::new());
    storage.connect().await.unwrap();
    let builder = EngineSettings::default().sql_builder();
    store::ensure_system_tables(storage.as_ref(), &builder).await.unwrap();
    (storage, builder)
}

/// Writes definition rows for one entity.
pub struct Seed<'a> {
    pub storage: &'a dyn StorageAdapter,
    pub builder: &'a SqlBuilder,
    pub entity: EntityDefinition,
}

impl<'a> Seed<'a> {
    pub async fn entity(storage: &'a dyn StorageAdapter, builder: &'a SqlBuilder, name: &str, table: &str) -> Seed<'a> {
        let entity = EntityDefinition::new(format!("{}-id", name), name, table);
        store::insert_entity(storage, builder, &entity).await.unwrap();
        Seed { storage, builder, entity }
    }

    pub fn id(&self) -> &str {
        &self.entity.id
    }

    pub async fn field(&self, field: FieldDefinition) -> &Self {
        store::insert_field(self.storage, self.builder, &field).await.unwrap();
        self
    }

    pub async fn grant(&self, role: &str, actions: &[Action]) -> &Self {
        for action in actions {
            store::insert_permission(self.storage, self.builder, &PermissionDefinition::allow(self.id(), role, *action))
                .await
                .unwrap();
        }
        self
    }

    pub async fn permission(&self, permission: PermissionDefinition) -> &Self {
        store::insert_permission(self.storage, self.builder, &permission).await.unwrap();
        self
    }

    pub async fn rls(&self, rule: RlsDefinition) -> &Self {
        store::insert_rls(self.storage, self.builder, &rule).await.unwrap();
        self
    }

    pub async fn view(&self, view: ViewDefinition) -> &Self {
        store::insert_view(self.storage, self.builder, &view).await.unwrap();
        self
    }

    pub async fn workflow(&self, workflow: WorkflowDefinition) -> &Self {
        store::insert_workflow(self.storage, self.builder, &workflow).await.unwrap();
        self
    }
}

pub const ALL_ACTIONS: [Action; 5] = [Action::Create, Action::Read, Action::Update, Action::Delete, Action::List];

pub fn record(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}
