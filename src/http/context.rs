use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use std::{ops::Deref, sync::Arc};

use crate::auth::verify_token;
use crate::collab::Notifier;
use crate::config::Config;
use crate::errors::{WireError, WireResult};
use crate::feed_actor::FeedActors;
use crate::home_feed::HomeFeedAssembler;
use crate::kv::KvStore;
use crate::posts::PostService;
use crate::rate_limit::RateLimiter;
use crate::user_actor::UserActors;

pub struct InnerWebContext {
    pub(crate) config: Arc<Config>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) users: UserActors,
    pub(crate) feeds: FeedActors,
    pub(crate) posts: PostService,
    pub(crate) assembler: HomeFeedAssembler,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) notifier: Arc<dyn Notifier>,
}

#[derive(Clone, FromRef)]
pub struct WebContext(pub(crate) Arc<InnerWebContext>);

impl Deref for WebContext {
    type Target = InnerWebContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl WebContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        kv: Arc<dyn KvStore>,
        users: UserActors,
        feeds: FeedActors,
        posts: PostService,
        assembler: HomeFeedAssembler,
        rate_limiter: RateLimiter,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self(Arc::new(InnerWebContext {
            config,
            kv,
            users,
            feeds,
            posts,
            assembler,
            rate_limiter,
            notifier,
        }))
    }
}

/// Authenticated caller, extracted from the `Authorization: Bearer` token.
/// Banned accounts authenticate but are refused.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: String,
    pub handle: String,
    pub email: String,
}

#[axum::async_trait]
impl FromRequestParts<WebContext> for AuthUser {
    type Rejection = WireError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &WebContext,
    ) -> WireResult<Self> {
        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| WireError::auth("missing authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| WireError::auth("authorization must be a bearer token"))?;

        let claims = verify_token(&state.config.token_secret, token)?;

        let banned = match state.users.is_banned(&claims.sub).await {
            Ok(banned) => banned,
            // A token for an account that no longer exists is just invalid.
            Err(WireError::NotInitialized(_)) | Err(WireError::NotFound(_)) => {
                return Err(WireError::auth("invalid token"));
            }
            Err(err) => return Err(err),
        };
        if banned {
            return Err(WireError::forbidden("account is banned"));
        }

        Ok(AuthUser {
            user_id: claims.sub,
            handle: claims.handle,
            email: claims.email,
        })
    }
}
