pub mod context;
pub mod handle_auth;
pub mod handle_feed;
pub mod handle_index;
pub mod handle_posts;
pub mod handle_users;
pub mod server;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// Standard response envelope: `{success, data}`.
pub(crate) fn success<T: Serialize>(data: T) -> Response {
    Json(json!({"success": true, "data": data})).into_response()
}

pub(crate) fn created<T: Serialize>(data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(json!({"success": true, "data": data})),
    )
        .into_response()
}

pub(crate) fn success_empty() -> Response {
    Json(json!({"success": true})).into_response()
}
