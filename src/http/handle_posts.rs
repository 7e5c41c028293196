use anyhow::Result;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Duration;
use serde_json::json;

use crate::errors::WireError;
use crate::posts::CreatePostRequest;

use super::context::{AuthUser, WebContext};
use super::{created, success, success_empty};

const CREATE_LIMIT: u32 = 60;

pub async fn handle_create_post(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Json(request): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, WireError> {
    web_context
        .rate_limiter
        .check("posts", &auth.user_id, CREATE_LIMIT, Duration::minutes(1))
        .await?;

    let post = web_context.posts.create(&auth.user_id, request).await?;
    Ok(created(post))
}

pub async fn handle_get_post(
    State(web_context): State<WebContext>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let post = web_context.posts.get_post(&id).await?;
    Ok(success(post))
}

pub async fn handle_thread(
    State(web_context): State<WebContext>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let thread = web_context.posts.thread(&id).await?;
    Ok(success(thread))
}

pub async fn handle_replies(
    State(web_context): State<WebContext>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let replies = web_context.posts.replies(&id).await?;
    Ok(success(replies))
}

pub async fn handle_delete_post(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    web_context.posts.delete(&auth.user_id, &id).await?;
    Ok(success_empty())
}

pub async fn handle_like(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let like_count = web_context.posts.like(&auth.user_id, &id).await?;
    Ok(success(json!({"likeCount": like_count})))
}

pub async fn handle_unlike(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let like_count = web_context.posts.unlike(&auth.user_id, &id).await?;
    Ok(success(json!({"likeCount": like_count})))
}

pub async fn handle_repost(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let post = web_context.posts.repost(&auth.user_id, &id).await?;
    Ok(created(post))
}

pub async fn handle_unrepost(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let repost_count = web_context.posts.unrepost(&auth.user_id, &id).await?;
    Ok(success(json!({"repostCount": repost_count})))
}
