use anyhow::Result;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::errors::WireError;

use super::context::WebContext;

pub async fn handle_index(
    State(web_context): State<WebContext>,
) -> Result<impl IntoResponse, WireError> {
    Ok(Json(json!({"ok": true, "version": web_context.config.version})).into_response())
}
