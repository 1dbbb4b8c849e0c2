//! Entity engine: configuration-driven CRUD over runtime-defined entities, with role
//! permissions, row-level security, tenant isolation, views and workflows.

pub mod config;
pub mod context;
pub mod error;
pub mod migration;
pub mod response;
pub mod security;
pub mod service;
pub mod settings;
pub mod sql;
pub mod storage;
pub mod store;
pub mod tenant;

pub use config::{Action, ConfigLoader, EntityConfiguration};
pub use context::Context;
pub use error::{EngineError, FieldError, StorageError};
pub use migration::SyncOutcome;
pub use response::{PageMeta, PermissionSummary, QueryResult, Record, ViewResult};
pub use security::PermissionPolicy;
pub use service::{EntityService, FindOptions, ViewOptions, WorkflowExecutor};
pub use settings::EngineSettings;
pub use sql::{Dialect, SqlBuilder};
pub use storage::{MemoryStorage, PgStorage, StorageAdapter};
pub use store::ensure_system_tables;
pub use tenant::{TenantIsolation, TenantScope};
