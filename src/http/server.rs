use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::context::WebContext;
use super::{handle_auth, handle_feed, handle_index, handle_posts, handle_users};

pub fn build_router(web_context: WebContext) -> Router {
    let origins = web_context.config.allowed_origins.as_ref();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
        )
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index::handle_index))
        .route("/api/auth/signup", post(handle_auth::handle_signup))
        .route("/api/auth/login", post(handle_auth::handle_login))
        .route("/api/auth/refresh", post(handle_auth::handle_refresh))
        .route("/api/auth/logout", post(handle_auth::handle_logout))
        .route("/api/auth/me", get(handle_auth::handle_me))
        .route(
            "/api/auth/reset/request",
            post(handle_auth::handle_reset_request),
        )
        .route(
            "/api/auth/reset/confirm",
            post(handle_auth::handle_reset_confirm),
        )
        .route(
            "/api/users/me",
            get(handle_users::handle_get_me).put(handle_users::handle_update_me),
        )
        .route(
            "/api/users/me/settings",
            get(handle_users::handle_get_settings).put(handle_users::handle_update_settings),
        )
        .route("/api/users/me/blocked", get(handle_users::handle_blocked))
        .route("/api/users/:handle", get(handle_users::handle_get_user))
        .route(
            "/api/users/:handle/follow",
            post(handle_users::handle_follow).delete(handle_users::handle_unfollow),
        )
        .route(
            "/api/users/:handle/block",
            post(handle_users::handle_block).delete(handle_users::handle_unblock),
        )
        .route(
            "/api/users/:handle/followers",
            get(handle_users::handle_followers),
        )
        .route(
            "/api/users/:handle/following",
            get(handle_users::handle_following),
        )
        .route("/api/posts", post(handle_posts::handle_create_post))
        .route(
            "/api/posts/:id",
            get(handle_posts::handle_get_post).delete(handle_posts::handle_delete_post),
        )
        .route("/api/posts/:id/thread", get(handle_posts::handle_thread))
        .route("/api/posts/:id/replies", get(handle_posts::handle_replies))
        .route(
            "/api/posts/:id/like",
            post(handle_posts::handle_like).delete(handle_posts::handle_unlike),
        )
        .route(
            "/api/posts/:id/repost",
            post(handle_posts::handle_repost).delete(handle_posts::handle_unrepost),
        )
        .route("/api/feed/home", get(handle_feed::handle_home_feed))
        .route(
            "/api/feed/chronological",
            get(handle_feed::handle_chronological_feed),
        )
        .route("/api/feed/global", get(handle_feed::handle_global_feed))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .with_state(web_context)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::collab::LogCollaborators;
    use crate::config::Config;
    use crate::fanout::FanoutWorker;
    use crate::feed_actor::FeedActors;
    use crate::home_feed::HomeFeedAssembler;
    use crate::kv::{KvStore, MemoryKv};
    use crate::post_actor::PostActors;
    use crate::posts::PostService;
    use crate::queue::{MemoryQueue, Queue};
    use crate::rate_limit::RateLimiter;
    use crate::user_actor::UserActors;

    struct TestApp {
        router: Router,
        worker: FanoutWorker,
        kv: Arc<dyn KvStore>,
    }

    fn test_app() -> TestApp {
        let config = Arc::new(Config::for_tests());
        let kv: Arc<dyn KvStore> = MemoryKv::shared();
        let queue: Arc<dyn Queue> = MemoryQueue::shared();
        let users = UserActors::new(kv.clone());
        let post_actors = PostActors::new(kv.clone());
        let feeds = FeedActors::new(kv.clone());
        let posts = PostService::new(
            kv.clone(),
            queue.clone(),
            users.clone(),
            post_actors.clone(),
            feeds.clone(),
            LogCollaborators::search(),
            LogCollaborators::notifier(),
            config.max_note_length,
            config.max_thread_depth,
        );
        let assembler = HomeFeedAssembler::new(
            kv.clone(),
            users.clone(),
            feeds.clone(),
            config.scoring.clone(),
        );
        let rate_limiter = RateLimiter::new(kv.clone());

        let kv_handle = kv.clone();
        let web_context = WebContext::new(
            config,
            kv,
            users.clone(),
            feeds.clone(),
            posts,
            assembler,
            rate_limiter,
            LogCollaborators::notifier(),
        );

        let worker = FanoutWorker::new(
            queue,
            users,
            feeds,
            16,
            16,
            chrono::Duration::seconds(1),
            tokio_util::sync::CancellationToken::new(),
        );

        TestApp {
            router: build_router(web_context),
            worker,
            kv: kv_handle,
        }
    }

    async fn send(
        app: &TestApp,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn signup(app: &TestApp, handle: &str) -> String {
        let (status, body) = send(
            app,
            Method::POST,
            "/api/auth/signup",
            None,
            Some(json!({
                "email": format!("{}@wire.example", handle),
                "password": "TestPass123!",
                "handle": handle,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "signup failed: {}", body);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    async fn create_post(app: &TestApp, token: &str, content: &str) -> String {
        let (status, body) = send(
            app,
            Method::POST,
            "/api/posts",
            Some(token),
            Some(json!({"content": content})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {}", body);
        body["data"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn signup_then_own_post_is_visible_in_home_feed() {
        let app = test_app();
        let token = signup(&app, "alice").await;
        let post_id = create_post(&app, &token, "hello").await;

        let (status, body) = send(&app, Method::GET, "/api/feed/home", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body["data"]["posts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&post_id.as_str()));
    }

    #[tokio::test]
    async fn follow_fan_out_reaches_chronological_feed() {
        let app = test_app();
        let alice = signup(&app, "alice").await;
        let bob = signup(&app, "bob").await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/users/bob/follow",
            Some(&alice),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let post_id = create_post(&app, &bob, "from bob").await;
        app.worker.drain().await.unwrap();

        let (status, body) = send(
            &app,
            Method::GET,
            "/api/feed/chronological",
            Some(&alice),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body["data"]["posts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&post_id.as_str()));
    }

    #[tokio::test]
    async fn block_removes_follow_edges_and_forbids_refollow() {
        let app = test_app();
        let alice = signup(&app, "alice").await;
        let bob = signup(&app, "bob").await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/users/bob/follow",
            Some(&alice),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/users/bob/block",
            Some(&alice),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, following) = send(
            &app,
            Method::GET,
            "/api/users/alice/following",
            Some(&alice),
            None,
        )
        .await;
        assert!(following["data"]["users"].as_array().unwrap().is_empty());

        let (_, followers) = send(
            &app,
            Method::GET,
            "/api/users/bob/followers",
            Some(&bob),
            None,
        )
        .await;
        assert!(followers["data"]["users"].as_array().unwrap().is_empty());

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/users/alice/follow",
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn double_repost_conflicts_over_http() {
        let app = test_app();
        let alice = signup(&app, "alice").await;
        let bob = signup(&app, "bob").await;

        let post_id = create_post(&app, &bob, "repostable").await;

        let uri = format!("/api/posts/{}/repost", post_id);
        let (status, _) = send(&app, Method::POST, &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, Method::POST, &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn post_round_trip_and_delete() {
        let app = test_app();
        let alice = signup(&app, "alice").await;
        let post_id = create_post(&app, &alice, "ephemeral").await;

        let uri = format!("/api/posts/{}", post_id);
        let (status, body) = send(&app, Method::GET, &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["content"], "ephemeral");
        assert_eq!(body["data"]["isDeleted"], false);

        let (status, _) = send(&app, Method::DELETE, &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::GET, &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["isDeleted"], true);
    }

    #[tokio::test]
    async fn auth_is_required_and_envelope_is_stable() {
        let app = test_app();

        let (status, body) = send(&app, Method::GET, "/api/feed/home", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        let (status, _) = send(
            &app,
            Method::GET,
            "/api/feed/home",
            Some("not-a-token"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_signup_conflicts() {
        let app = test_app();
        signup(&app, "alice").await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/signup",
            None,
            Some(json!({
                "email": "other@wire.example",
                "password": "TestPass123!",
                "handle": "alice",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/signup",
            None,
            Some(json!({
                "email": "alice@wire.example",
                "password": "TestPass123!",
                "handle": "alice2",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_handles_are_rejected() {
        let app = test_app();
        for handle in ["ab", "_alice", "Has Space", "admin"] {
            let (status, _) = send(
                &app,
                Method::POST,
                "/api/auth/signup",
                None,
                Some(json!({
                    "email": format!("{}@wire.example", handle.to_lowercase()),
                    "password": "TestPass123!",
                    "handle": handle,
                })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "handle {:?}", handle);
        }
    }

    #[tokio::test]
    async fn login_and_refresh_flow() {
        let app = test_app();
        signup(&app, "alice").await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "alice@wire.example", "password": "TestPass123!"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["token"].as_str().unwrap().to_string();

        let (status, body) = send(&app, Method::GET, "/api/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["handle"], "alice");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/refresh",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["token"].is_string());

        // Wrong password and unknown email fail identically.
        let (status, wrong) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "alice@wire.example", "password": "nope-nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, unknown) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "ghost@wire.example", "password": "nope-nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong["error"], unknown["error"]);
    }

    #[tokio::test]
    async fn password_reset_flow() {
        let app = test_app();
        let token = signup(&app, "alice").await;

        let (_, me) = send(&app, Method::GET, "/api/auth/me", Some(&token), None).await;
        let user_id = me["data"]["id"].as_str().unwrap().to_string();

        // Unknown and known emails get the same success shape.
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/reset/request",
            None,
            Some(json!({"email": "ghost@wire.example"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/reset/request",
            None,
            Some(json!({"email": "alice@wire.example"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let reset_token: String = crate::kv::get_json(
            app.kv.as_ref(),
            &crate::model::reset_user_key(&user_id),
        )
        .await
        .unwrap()
        .expect("reset token stored");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/reset/confirm",
            None,
            Some(json!({"token": reset_token, "newPassword": "FreshPass456!"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "alice@wire.example", "password": "TestPass123!"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({"email": "alice@wire.example", "password": "FreshPass456!"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn profile_update_and_cached_view() {
        let app = test_app();
        let alice = signup(&app, "alice").await;

        let (status, body) = send(
            &app,
            Method::PUT,
            "/api/users/me",
            Some(&alice),
            Some(json!({"displayName": "Alice!", "bio": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["displayName"], "Alice!");

        let (status, body) = send(&app, Method::GET, "/api/users/alice", Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["displayName"], "Alice!");
        assert_eq!(body["data"]["handle"], "alice");
    }
}
