use std::collections::BTreeSet;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::Query;
use serde::Deserialize;

use crate::errors::{WireError, WireResult};
use crate::feed_actor::{decode_cursor, encode_cursor};
use crate::kv;
use crate::model::{handle_key, profile_key, ProfileView};
use crate::user_actor::{ProfilePatch, SettingsPatch};

use super::context::{AuthUser, WebContext};
use super::{success, success_empty};

#[derive(Deserialize, Default)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

async fn resolve_handle(web_context: &WebContext, handle: &str) -> WireResult<String> {
    let handle = handle.trim().to_lowercase();
    kv::get_json::<String>(web_context.kv.as_ref(), &handle_key(&handle))
        .await?
        .ok_or_else(|| WireError::not_found("user"))
}

pub async fn handle_get_me(
    State(web_context): State<WebContext>,
    auth: AuthUser,
) -> Result<impl IntoResponse, WireError> {
    let view = web_context.users.profile_view(&auth.user_id).await?;
    Ok(success(view))
}

pub async fn handle_update_me(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Json(patch): Json<ProfilePatch>,
) -> Result<impl IntoResponse, WireError> {
    let view = web_context
        .users
        .update_profile(&auth.user_id, patch)
        .await?;
    Ok(success(view))
}

pub async fn handle_get_settings(
    State(web_context): State<WebContext>,
    auth: AuthUser,
) -> Result<impl IntoResponse, WireError> {
    let settings = web_context.users.settings(&auth.user_id).await?;
    Ok(success(settings))
}

pub async fn handle_update_settings(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Json(patch): Json<SettingsPatch>,
) -> Result<impl IntoResponse, WireError> {
    let settings = web_context
        .users
        .update_settings(&auth.user_id, patch)
        .await?;
    Ok(success(settings))
}

/// Public profile, served from the `profile:{handle}` cache when warm.
pub async fn handle_get_user(
    State(web_context): State<WebContext>,
    _auth: AuthUser,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let handle = handle.trim().to_lowercase();

    if let Some(cached) =
        kv::get_json::<ProfileView>(web_context.kv.as_ref(), &profile_key(&handle)).await?
    {
        return Ok(success(cached));
    }

    let user_id = resolve_handle(&web_context, &handle).await?;
    let view = web_context.users.profile_view(&user_id).await?;
    kv::put_json(
        web_context.kv.as_ref(),
        &profile_key(&handle),
        &view,
        Some(web_context.config.cache_ttl.profile),
    )
    .await?;

    Ok(success(view))
}

pub async fn handle_follow(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let target_id = resolve_handle(&web_context, &handle).await?;
    if target_id == auth.user_id {
        return Err(WireError::validation("cannot follow yourself"));
    }
    if web_context
        .users
        .is_blocked(&target_id, &auth.user_id)
        .await?
    {
        return Err(WireError::forbidden("you are blocked by this user"));
    }
    if web_context
        .users
        .is_blocked(&auth.user_id, &target_id)
        .await?
    {
        return Err(WireError::forbidden("unblock this user first"));
    }

    web_context.users.follow(&auth.user_id, &target_id).await?;
    web_context
        .users
        .add_follower(&target_id, &auth.user_id)
        .await?;
    Ok(success_empty())
}

pub async fn handle_unfollow(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let target_id = resolve_handle(&web_context, &handle).await?;
    web_context.users.unfollow(&auth.user_id, &target_id).await?;
    web_context
        .users
        .remove_follower(&target_id, &auth.user_id)
        .await?;
    Ok(success_empty())
}

pub async fn handle_block(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let target_id = resolve_handle(&web_context, &handle).await?;
    if target_id == auth.user_id {
        return Err(WireError::validation("cannot block yourself"));
    }

    web_context.users.block(&auth.user_id, &target_id).await?;
    // Sever the mirror edges on the target's actor too.
    web_context
        .users
        .remove_follower(&target_id, &auth.user_id)
        .await?;
    web_context.users.unfollow(&target_id, &auth.user_id).await?;
    Ok(success_empty())
}

pub async fn handle_unblock(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, WireError> {
    let target_id = resolve_handle(&web_context, &handle).await?;
    web_context.users.unblock(&auth.user_id, &target_id).await?;
    Ok(success_empty())
}

pub async fn handle_followers(
    State(web_context): State<WebContext>,
    _auth: AuthUser,
    Path(handle): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, WireError> {
    let user_id = resolve_handle(&web_context, &handle).await?;
    let members = web_context.users.followers(&user_id).await?;
    Ok(user_list(&web_context, members, params).await?)
}

pub async fn handle_following(
    State(web_context): State<WebContext>,
    _auth: AuthUser,
    Path(handle): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, WireError> {
    let user_id = resolve_handle(&web_context, &handle).await?;
    let members = web_context.users.following(&user_id).await?;
    Ok(user_list(&web_context, members, params).await?)
}

pub async fn handle_blocked(
    State(web_context): State<WebContext>,
    auth: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, WireError> {
    let members = web_context.users.blocked(&auth.user_id).await?;
    Ok(user_list(&web_context, members, params).await?)
}

async fn user_list(
    web_context: &WebContext,
    members: BTreeSet<String>,
    params: ListParams,
) -> WireResult<axum::response::Response> {
    let limit = params
        .limit
        .unwrap_or(web_context.config.default_feed_page_size)
        .min(web_context.config.max_pagination_limit)
        .max(1);
    let start = decode_cursor(&params.cursor);

    let page: Vec<String> = members.iter().skip(start).take(limit).cloned().collect();
    let has_more = start + page.len() < members.len();
    let cursor = if has_more {
        Some(encode_cursor(start + page.len()))
    } else {
        None
    };

    let mut users = Vec::with_capacity(page.len());
    for member_id in page {
        // Accounts can disappear between the set read and the view read.
        if let Ok(view) = web_context.users.profile_view(&member_id).await {
            users.push(view);
        }
    }

    Ok(success(serde_json::json!({
        "users": users,
        "cursor": cursor,
        "hasMore": has_more,
    })))
}
