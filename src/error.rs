//! Typed errors and HTTP mapping.

use crate::config::Action;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// One field-level validation failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Failures raised by storage adapters.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not connected")]
    NotConnected,
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("unknown column {column} in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("duplicate key {column}={value} in {table}")]
    DuplicateKey { table: String, column: String, value: String },
    #[error("sql parse: {0}")]
    Parse(String),
    #[error("unsupported statement: {0}")]
    Unsupported(String),
    #[error("missing parameter at position {0}")]
    MissingParameter(usize),
    #[error("transaction: {0}")]
    Transaction(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {}", describe_missing(entity, id.as_deref()))]
    NotFound { entity: String, id: Option<String> },
    #[error("validation failed for {entity}: {}", describe_fields(errors))]
    Validation { entity: String, errors: Vec<FieldError> },
    #[error("permission denied: {action} on {entity} for roles {roles:?}")]
    Permission {
        entity: String,
        action: Action,
        roles: Vec<String>,
    },
    #[error("query build: {0}")]
    QueryBuild(String),
    #[error("storage ({operation}): {source}")]
    Storage {
        operation: String,
        #[source]
        source: StorageError,
    },
    #[error("schema load for {entity}: {message}")]
    SchemaLoad { entity: String, message: String },
    #[error("workflow {trigger} on {entity}: {message}")]
    Workflow {
        entity: String,
        trigger: String,
        message: String,
    },
}

fn describe_missing(entity: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("{} '{}'", entity, id),
        None => format!("entity '{}'", entity),
    }
}

fn describe_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{} ({})", e.field, e.code))
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineError {
    /// Wrap a storage failure with the name of the operation that hit it.
    pub fn storage(operation: impl Into<String>, source: StorageError) -> Self {
        EngineError::Storage {
            operation: operation.into(),
            source,
        }
    }

    pub fn entity_not_found(entity: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity: entity.into(),
            id: None,
        }
    }

    pub fn record_not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity: entity.into(),
            id: Some(id.into()),
        }
    }

    pub fn validation(entity: impl Into<String>, errors: Vec<FieldError>) -> Self {
        EngineError::Validation {
            entity: entity.into(),
            errors,
        }
    }

    /// Stable machine-readable code for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Validation { .. } => "validation_error",
            EngineError::Permission { .. } => "permission_denied",
            EngineError::QueryBuild(_) => "bad_request",
            EngineError::Storage { .. } => "storage_error",
            EngineError::SchemaLoad { .. } => "schema_load_error",
            EngineError::Workflow { .. } => "workflow_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Permission { .. } => StatusCode::FORBIDDEN,
            EngineError::QueryBuild(_) => StatusCode::BAD_REQUEST,
            EngineError::Storage { .. }
            | EngineError::SchemaLoad { .. }
            | EngineError::Workflow { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let details = match &self {
            EngineError::Validation { errors, .. } => serde_json::to_value(errors).ok(),
            EngineError::NotFound { entity, id } => Some(serde_json::json!({ "entity": entity, "id": id })),
            EngineError::Permission { entity, action, .. } => {
                Some(serde_json::json!({ "entity": entity, "action": action.as_str() }))
            }
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
