use std::collections::BTreeSet;

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, Json};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{
    hash_password, new_reset_token, new_salt, sign_token, validate_email, validate_handle,
    validate_password, verify_password, ResetToken, TokenClaims,
};
use crate::errors::{WireError, WireResult};
use crate::ids::new_id;
use crate::kv;
use crate::model::{
    email_key, handle_key, reset_token_key, reset_user_key, FeedEntry, FeedSource, Profile,
    Settings,
};
use crate::user_actor::UserState;

use super::context::{AuthUser, WebContext};
use super::{created, success, success_empty};

const SIGNUP_LIMIT: u32 = 10;
const LOGIN_LIMIT: u32 = 10;
const RESET_LIMIT: u32 = 3;
const RESET_TOKEN_TTL_MINUTES: i64 = 15;

const MAX_SEED_USERS: usize = 20;
const MAX_SEED_BACKFILL_POSTS: usize = 10;

#[derive(Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub handle: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ResetRequest {
    pub email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

pub async fn handle_signup(
    State(web_context): State<WebContext>,
    Json(request): Json<SignupRequest>,
) -> Result<impl IntoResponse, WireError> {
    let email = request.email.trim().to_lowercase();
    let handle = request.handle.trim().to_lowercase();

    web_context
        .rate_limiter
        .check("signup", &email, SIGNUP_LIMIT, Duration::hours(1))
        .await?;

    validate_handle(&handle)?;
    validate_email(&email)?;
    validate_password(&request.password)?;

    let user_id = new_id();

    // Claim the uniqueness keys before creating the account. The store is
    // last-writer-wins, so writing our id and reading it back tells us
    // whether a concurrent signup beat us to the name.
    if !claim(&web_context, &handle_key(&handle), &user_id).await? {
        return Err(WireError::conflict("handle is already taken"));
    }
    if !claim(&web_context, &email_key(&email), &user_id).await? {
        release(&web_context, &handle_key(&handle), &user_id).await;
        return Err(WireError::conflict("email is already registered"));
    }

    let salt = new_salt();
    let password_hash = hash_password(&request.password, &salt)?;
    let now = Utc::now();

    let state = UserState {
        id: user_id.clone(),
        handle: handle.clone(),
        email: email.clone(),
        password_hash,
        salt,
        created_at: now,
        last_login: Some(now),
        profile: Profile::new(&handle, now),
        settings: Settings::default(),
        following: BTreeSet::new(),
        followers: BTreeSet::new(),
        blocked: BTreeSet::new(),
        liked_posts: Vec::new(),
    };
    web_context.users.initialize(state).await?;

    if web_context.config.initial_admin_handle.as_deref() == Some(handle.as_str()) {
        web_context.users.set_admin(&user_id, true).await?;
    }

    auto_follow_seeds(&web_context, &user_id).await;

    let claims = TokenClaims::new(&user_id, &email, &handle, web_context.config.token_ttl);
    let token = sign_token(&web_context.config.token_secret, &claims)?;
    let user = web_context.users.profile_view(&user_id).await?;

    Ok(created(json!({"token": token, "user": user})))
}

async fn claim(web_context: &WebContext, key: &str, user_id: &str) -> WireResult<bool> {
    if web_context.kv.get(key).await?.is_some() {
        return Ok(false);
    }
    kv::put_json(web_context.kv.as_ref(), key, &user_id.to_string(), None).await?;
    let owner: Option<String> = kv::get_json(web_context.kv.as_ref(), key).await?;
    Ok(owner.as_deref() == Some(user_id))
}

async fn release(web_context: &WebContext, key: &str, user_id: &str) {
    let owner: Result<Option<String>, _> = kv::get_json(web_context.kv.as_ref(), key).await;
    if let Ok(Some(owner)) = owner {
        if owner == user_id {
            if let Err(err) = web_context.kv.delete(key).await {
                tracing::warn!(key = %key, error = ?err, "failed to release uniqueness claim");
            }
        }
    }
}

/// Operator-configured accounts every signup starts out following, with a
/// bounded timeline backfill so the first home feed is not empty.
async fn auto_follow_seeds(web_context: &WebContext, user_id: &str) {
    let Some(seeds) = &web_context.config.seed_users else {
        return;
    };

    for seed in seeds.seed_users.iter().take(MAX_SEED_USERS) {
        let seed_id: Option<String> =
            match kv::get_json(web_context.kv.as_ref(), &handle_key(&seed.handle)).await {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(handle = %seed.handle, error = ?err, "seed lookup failed");
                    continue;
                }
            };
        let Some(seed_id) = seed_id else {
            tracing::warn!(handle = %seed.handle, "seed user does not exist");
            continue;
        };
        if seed_id == user_id {
            continue;
        }

        if let Err(err) = follow_seed(web_context, user_id, &seed_id).await {
            tracing::warn!(handle = %seed.handle, error = ?err, "seed auto-follow failed");
        }
    }
}

async fn follow_seed(web_context: &WebContext, user_id: &str, seed_id: &str) -> WireResult<()> {
    web_context.users.follow(user_id, seed_id).await?;
    web_context.users.add_follower(seed_id, user_id).await?;

    let post_ids = web_context.posts.user_posts(seed_id).await?;
    for post_id in post_ids.into_iter().take(MAX_SEED_BACKFILL_POSTS) {
        let Ok(post) = web_context.posts.get_post(&post_id).await else {
            continue;
        };
        if !post.is_visible() {
            continue;
        }
        web_context
            .feeds
            .add_entry(
                user_id,
                FeedEntry {
                    post_id: post.id.clone(),
                    author_id: post.author_id.clone(),
                    timestamp: post.created_at,
                    source: FeedSource::Follow,
                },
            )
            .await?;
    }
    Ok(())
}

pub async fn handle_login(
    State(web_context): State<WebContext>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, WireError> {
    let email = request.email.trim().to_lowercase();

    web_context
        .rate_limiter
        .check("login", &email, LOGIN_LIMIT, Duration::minutes(1))
        .await?;

    // One failure shape regardless of which check failed, so the endpoint
    // does not confirm which emails exist.
    let invalid = || WireError::auth("invalid email or password");

    let user_id: String = kv::get_json(web_context.kv.as_ref(), &email_key(&email))
        .await?
        .ok_or_else(invalid)?;
    let user = web_context.users.get(&user_id).await.map_err(|_| invalid())?;

    if !verify_password(&request.password, &user.salt, &user.password_hash)? {
        return Err(invalid());
    }
    if user.profile.is_banned {
        return Err(WireError::forbidden("account is banned"));
    }

    web_context.users.touch_login(&user_id).await?;

    let claims = TokenClaims::new(
        &user.id,
        &user.email,
        &user.handle,
        web_context.config.token_ttl,
    );
    let token = sign_token(&web_context.config.token_secret, &claims)?;
    let view = web_context.users.profile_view(&user_id).await?;

    Ok(success(json!({"token": token, "user": view})))
}

pub async fn handle_refresh(
    State(web_context): State<WebContext>,
    auth: AuthUser,
) -> Result<impl IntoResponse, WireError> {
    let claims = TokenClaims::new(
        &auth.user_id,
        &auth.email,
        &auth.handle,
        web_context.config.token_ttl,
    );
    let token = sign_token(&web_context.config.token_secret, &claims)?;
    Ok(success(json!({"token": token})))
}

// Tokens are stateless; logout exists so clients have a definite end of
// session to act on.
pub async fn handle_logout(_auth: AuthUser) -> Result<impl IntoResponse, WireError> {
    Ok(success_empty())
}

pub async fn handle_me(
    State(web_context): State<WebContext>,
    auth: AuthUser,
) -> Result<impl IntoResponse, WireError> {
    let view = web_context.users.profile_view(&auth.user_id).await?;
    Ok(success(view))
}

pub async fn handle_reset_request(
    State(web_context): State<WebContext>,
    Json(request): Json<ResetRequest>,
) -> Result<impl IntoResponse, WireError> {
    let email = request.email.trim().to_lowercase();

    web_context
        .rate_limiter
        .check(
            "reset",
            &email,
            RESET_LIMIT,
            Duration::minutes(RESET_TOKEN_TTL_MINUTES),
        )
        .await?;

    // Unknown emails get the same response; no enumeration.
    if let Some(user_id) =
        kv::get_json::<String>(web_context.kv.as_ref(), &email_key(&email)).await?
    {
        let token = new_reset_token();
        let ttl = Duration::minutes(RESET_TOKEN_TTL_MINUTES);
        let record = ResetToken {
            user_id: user_id.clone(),
            expires_at: Utc::now() + ttl,
        };
        kv::put_json(
            web_context.kv.as_ref(),
            &reset_token_key(&token),
            &record,
            Some(ttl),
        )
        .await?;
        kv::put_json(
            web_context.kv.as_ref(),
            &reset_user_key(&user_id),
            &token,
            Some(ttl),
        )
        .await?;

        web_context.notifier.password_reset(&email, &token).await;
    }

    Ok(success_empty())
}

pub async fn handle_reset_confirm(
    State(web_context): State<WebContext>,
    Json(request): Json<ResetConfirmRequest>,
) -> Result<impl IntoResponse, WireError> {
    validate_password(&request.new_password)?;

    let record: ResetToken =
        kv::get_json(web_context.kv.as_ref(), &reset_token_key(&request.token))
            .await?
            .ok_or_else(|| WireError::validation("invalid or expired reset token"))?;
    if record.expires_at <= Utc::now() {
        return Err(WireError::validation("invalid or expired reset token"));
    }

    let salt = new_salt();
    let hash = hash_password(&request.new_password, &salt)?;
    web_context
        .users
        .set_password(&record.user_id, &hash, &salt)
        .await?;

    web_context
        .kv
        .delete(&reset_token_key(&request.token))
        .await?;
    web_context
        .kv
        .delete(&reset_user_key(&record.user_id))
        .await?;

    Ok(success_empty())
}
