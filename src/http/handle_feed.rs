use anyhow::Result;
use axum::{extract::State, response::IntoResponse};
use axum_extra::extract::Query;
use serde::Deserialize;

use crate::errors::WireError;

use super::context::{AuthUser, WebContext};
use super::success;

#[derive(Deserialize, Default)]
pub struct FeedParams {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

fn clamp_limit(web_context: &WebContext, requested: Option<usize>) -> usize {
    requested
        .unwrap_or(web_context.config.default_feed_page_size)
        .min(web_context.config.max_pagination_limit)
        .max(1)
}

pub async fn handle_home_feed(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Query(params): Query<FeedParams>,
) -> Result<impl IntoResponse, WireError> {
    let limit = clamp_limit(&web_context, params.limit);
    let feed = web_context
        .assembler
        .assemble(&auth.user_id, params.cursor, limit)
        .await?;
    Ok(success(feed))
}

pub async fn handle_chronological_feed(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Query(params): Query<FeedParams>,
) -> Result<impl IntoResponse, WireError> {
    let limit = clamp_limit(&web_context, params.limit);
    let feed = web_context
        .assembler
        .chronological(&auth.user_id, params.cursor, limit)
        .await?;
    Ok(success(feed))
}

pub async fn handle_global_feed(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Query(params): Query<FeedParams>,
) -> Result<impl IntoResponse, WireError> {
    let limit = clamp_limit(&web_context, params.limit);
    let feed = web_context
        .assembler
        .global(&auth.user_id, params.cursor, limit)
        .await?;
    Ok(success(feed))
}
