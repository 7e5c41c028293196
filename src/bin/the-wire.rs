use std::env;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

use the_wire::collab::LogCollaborators;
use the_wire::fanout::FanoutWorker;
use the_wire::feed_actor::FeedActors;
use the_wire::home_feed::HomeFeedAssembler;
use the_wire::http::context::WebContext;
use the_wire::http::server::build_router;
use the_wire::kv::SqliteKv;
use the_wire::post_actor::PostActors;
use the_wire::posts::PostService;
use the_wire::queue::SqliteQueue;
use the_wire::ranker::{CompactionTask, FeedGcTask, RankerTask};
use the_wire::rate_limit::RateLimiter;
use the_wire::user_actor::UserActors;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "the_wire=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();

    let version = the_wire::config::version()?;

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{}", version);
            std::process::exit(0);
        }
    });

    let config = Arc::new(the_wire::config::Config::new()?);

    let pool = SqlitePool::connect(&config.database_url).await?;
    sqlx::migrate!().run(&pool).await?;

    let kv = SqliteKv::shared(pool.clone());
    let queue = SqliteQueue::shared(pool.clone());

    let users = UserActors::new(kv.clone());
    let post_actors = PostActors::new(kv.clone());
    let feeds = FeedActors::new(kv.clone());

    let search = LogCollaborators::search();
    let notifier = LogCollaborators::notifier();

    let posts = PostService::new(
        kv.clone(),
        queue.clone(),
        users.clone(),
        post_actors.clone(),
        feeds.clone(),
        search,
        notifier.clone(),
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

    let web_context = WebContext::new(
        config.clone(),
        kv.clone(),
        users.clone(),
        feeds.clone(),
        posts,
        assembler,
        rate_limiter,
        notifier,
    );

    let app = build_router(web_context);

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    spawn_stop_watcher(tracker.clone(), token.clone());

    {
        let inner_config = config.clone();
        if *inner_config.fanout_enable.as_ref() {
            let worker = FanoutWorker::new(
                queue.clone(),
                users.clone(),
                feeds.clone(),
                inner_config.fanout_batch_size,
                inner_config.fanout_concurrency,
                *inner_config.fanout_poll_interval.as_ref(),
                token.clone(),
            );
            let inner_token = token.clone();
            tracker.spawn(async move {
                if let Err(err) = worker.run_background().await {
                    tracing::warn!(error = ?err, "fan-out worker error");
                }
                inner_token.cancel();
            });
        }
    }

    {
        let inner_config = config.clone();
        if *inner_config.ranker_enable.as_ref() {
            let task = RankerTask::new(kv.clone(), config.clone(), token.clone());
            task.main().await?;
            let inner_token = token.clone();
            let interval = *inner_config.ranker_interval.as_ref();
            tracker.spawn(async move {
                if let Err(err) = task.run_background(interval).await {
                    tracing::warn!(error = ?err, "ranker task error");
                }
                inner_token.cancel();
            });
        }
    }

    {
        let inner_config = config.clone();
        if *inner_config.feed_gc_enable.as_ref() {
            let task = FeedGcTask::new(
                kv.clone(),
                feeds.clone(),
                inner_config.retention.feed_entries,
                token.clone(),
            );
            let inner_token = token.clone();
            let interval = *inner_config.feed_gc_interval.as_ref();
            tracker.spawn(async move {
                if let Err(err) = task.run_background(interval).await {
                    tracing::warn!(error = ?err, "feed gc task error");
                }
                inner_token.cancel();
            });
        }
    }

    {
        let inner_config = config.clone();
        if *inner_config.compaction_enable.as_ref() {
            let task = CompactionTask::new(
                kv.clone(),
                post_actors.clone(),
                inner_config.retention.deleted_posts,
                token.clone(),
            );
            let inner_token = token.clone();
            let interval = *inner_config.compaction_interval.as_ref();
            tracker.spawn(async move {
                if let Err(err) = task.run_background(interval).await {
                    tracing::warn!(error = ?err, "compaction task error");
                }
                inner_token.cancel();
            });
        }
    }

    {
        let http_port = *config.http_port.as_ref();
        let http_token = token.clone();
        tracker.spawn(async move {
            if let Err(err) = serve_http(app, http_port, http_token.clone()).await {
                tracing::error!("http server failed: {}", err);
            }
            http_token.cancel();
        });
    }

    tracker.wait().await;

    Ok(())
}

/// Resolves when the operator asks the process to stop, via SIGINT or
/// SIGTERM.
async fn stop_requested() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

/// Watches for a stop request (or a task cancelling the shared token on its
/// own) and flips the whole process into shutdown: no new tasks, every
/// `run_background` loop told to wind down.
fn spawn_stop_watcher(tracker: TaskTracker, token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = stop_requested() => {
                tracing::info!("stop requested, shutting down");
            }
        }
        tracker.close();
        token.cancel();
    });
}

/// Serves the API until the shutdown token fires, then drains in-flight
/// requests before returning.
async fn serve_http(app: Router, port: u16, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    tracing::info!("http server drained");
    Ok(())
}
