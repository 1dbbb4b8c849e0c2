//! Result shapes returned by the entity service, with axum response helpers for API layers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};

pub type Record = Map<String, Value>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub has_more: bool,
}

impl PageMeta {
    pub fn new(total: u64, page: u64, per_page: u64) -> Self {
        PageMeta {
            total,
            page,
            per_page,
            has_more: page.saturating_mul(per_page) < total,
        }
    }

    /// Rows to skip for this page; pages start at 1.
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.per_page)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub data: Vec<Record>,
    pub meta: PageMeta,
}

/// What the caller may do next with the entity, reported alongside view results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSummary {
    pub can_create: bool,
    pub can_update: bool,
    pub can_delete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ViewResult {
    pub data: Vec<Record>,
    pub meta: PageMeta,
    pub permissions: PermissionSummary,
}

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
}

/// `201 Created` with `{data}`.
pub fn success_created<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::CREATED, Json(SuccessOne { data }))
}

/// `200 OK` with `{data}`.
pub fn success_ok<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::OK, Json(SuccessOne { data }))
}

impl IntoResponse for QueryResult {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

impl IntoResponse for ViewResult {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}
