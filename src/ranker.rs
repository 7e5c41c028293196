use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::WireResult;
use crate::feed_actor::FeedActors;
use crate::ids::id_floor;
use crate::kv::{self, KvStore};
use crate::model::{post_key, Post, RankedRef, EXPLORE_RANKED_KEY, FOF_RANKED_KEY};
use crate::post_actor::PostActors;

// Bounded work per run: rankings are advisory and refresh every few
// minutes, so scanning a slice of recent posts is enough.
const SCAN_BATCHES: usize = 2;
const SCAN_BATCH_SIZE: usize = 40;
const SCAN_LOOKBACK_HOURS: i64 = 48;

pub const DIVERSITY_WINDOW: usize = 5;
const MAX_PER_AUTHOR_IN_WINDOW: usize = 2;
const COMPACT_RANKING_SIZE: usize = 100;

struct Scored {
    post: Post,
    score: f64,
}

/// Greedy author-diversity pass over a score-sorted candidate list: pick the
/// highest-scored post that keeps every `window`-sized run at or under
/// `max_per_author`; when nothing qualifies, admit the highest remaining so
/// the pass always makes progress.
fn apply_author_diversity(mut candidates: Vec<Scored>, cap: usize) -> Vec<Scored> {
    let mut selected: Vec<Scored> = Vec::with_capacity(cap.min(candidates.len()));
    while !candidates.is_empty() && selected.len() < cap {
        let window_start = selected.len().saturating_sub(DIVERSITY_WINDOW - 1);
        let window = &selected[window_start..];

        let index = candidates
            .iter()
            .position(|candidate| {
                window
                    .iter()
                    .filter(|s| s.post.author_id == candidate.post.author_id)
                    .count()
                    < MAX_PER_AUTHOR_IN_WINDOW
            })
            .unwrap_or(0);
        selected.push(candidates.remove(index));
    }
    selected
}

/// Periodically scores recent posts and refreshes the two ranked discovery
/// blobs (`fof:ranked` compact refs, `explore:ranked` full snapshots).
pub struct RankerTask {
    kv: Arc<dyn KvStore>,
    config: Arc<Config>,
    cancellation_token: CancellationToken,
}

impl RankerTask {
    pub fn new(kv: Arc<dyn KvStore>, config: Arc<Config>, token: CancellationToken) -> Self {
        Self {
            kv,
            config,
            cancellation_token: token,
        }
    }

    pub async fn run_background(&self, interval: chrono::Duration) -> Result<()> {
        let interval = interval.to_std()?;

        let sleeper = tokio::time::sleep(interval);
        tokio::pin!(sleeper);

        loop {
            tokio::select! {
            () = self.cancellation_token.cancelled() => {
                break;
            },
            () = &mut sleeper => {
                    if let Err(err) = self.main().await {
                        tracing::error!("RankerTask task failed: {}", err);
                    }
                sleeper.as_mut().reset(tokio::time::Instant::now() + interval);
            }
            }
        }
        Ok(())
    }

    pub async fn main(&self) -> WireResult<()> {
        let now = Utc::now();
        let posts = self.scan_recent(now).await?;

        let mut scored: Vec<Scored> = posts
            .into_iter()
            .filter(|post| post.is_visible())
            .map(|post| {
                let score = post.hn_score(&self.config.scoring, now);
                Scored { post, score }
            })
            .collect();

        // Equal scores: newer id first.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.post.id.cmp(&a.post.id))
        });

        let ranked = apply_author_diversity(scored, self.config.max_feed_entries);

        let compact: Vec<RankedRef> = ranked
            .iter()
            .take(COMPACT_RANKING_SIZE)
            .map(|s| RankedRef {
                post_id: s.post.id.clone(),
                score: s.score,
                author_id: s.post.author_id.clone(),
            })
            .collect();
        let snapshots: Vec<Post> = ranked.into_iter().map(|s| s.post).collect();

        let ttl = Some(self.config.cache_ttl.fof_rankings);
        kv::put_json(self.kv.as_ref(), FOF_RANKED_KEY, &compact, ttl).await?;
        kv::put_json(self.kv.as_ref(), EXPLORE_RANKED_KEY, &snapshots, ttl).await?;

        tracing::debug!(ranked = snapshots.len(), "discovery rankings refreshed");
        Ok(())
    }

    async fn scan_recent(&self, now: DateTime<Utc>) -> WireResult<Vec<Post>> {
        let floor = post_key(&id_floor(now - chrono::Duration::hours(SCAN_LOOKBACK_HOURS)));
        let mut cursor = Some(floor);
        let mut posts = Vec::new();

        for _ in 0..SCAN_BATCHES {
            let scan = self.kv.list("post:", SCAN_BATCH_SIZE, cursor).await?;
            for key in &scan.keys {
                if let Some(post) = kv::get_json::<Post>(self.kv.as_ref(), key).await? {
                    posts.push(post);
                }
            }
            if scan.done {
                break;
            }
            cursor = scan.next_cursor;
        }
        Ok(posts)
    }
}

/// Hourly sweep dropping feed entries past the retention window.
pub struct FeedGcTask {
    kv: Arc<dyn KvStore>,
    feeds: FeedActors,
    max_age: chrono::Duration,
    cancellation_token: CancellationToken,
}

impl FeedGcTask {
    pub fn new(
        kv: Arc<dyn KvStore>,
        feeds: FeedActors,
        max_age: chrono::Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            kv,
            feeds,
            max_age,
            cancellation_token: token,
        }
    }

    pub async fn run_background(&self, interval: chrono::Duration) -> Result<()> {
        let interval = interval.to_std()?;

        let sleeper = tokio::time::sleep(interval);
        tokio::pin!(sleeper);

        loop {
            tokio::select! {
            () = self.cancellation_token.cancelled() => {
                break;
            },
            () = &mut sleeper => {
                    if let Err(err) = self.main().await {
                        tracing::error!("FeedGcTask task failed: {}", err);
                    }
                sleeper.as_mut().reset(tokio::time::Instant::now() + interval);
            }
            }
        }
        Ok(())
    }

    pub async fn main(&self) -> WireResult<()> {
        let cutoff = Utc::now() - self.max_age;
        let mut cursor = None;
        let mut pruned = 0;

        loop {
            let scan = self.kv.list("feed:", 100, cursor).await?;
            for key in &scan.keys {
                let Some(user_id) = key.strip_prefix("feed:") else {
                    continue;
                };
                pruned += self.feeds.prune_older_than(user_id, cutoff).await?;
            }
            if scan.done {
                break;
            }
            cursor = scan.next_cursor;
        }

        if pruned > 0 {
            tracing::debug!(pruned, "expired feed entries dropped");
        }
        Ok(())
    }
}

/// Daily compaction: hard-delete soft-deleted and taken-down post records
/// past retention (with their actor state) and purge expired KV rows.
pub struct CompactionTask {
    kv: Arc<dyn KvStore>,
    post_actors: PostActors,
    retention: chrono::Duration,
    cancellation_token: CancellationToken,
}

impl CompactionTask {
    pub fn new(
        kv: Arc<dyn KvStore>,
        post_actors: PostActors,
        retention: chrono::Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            kv,
            post_actors,
            retention,
            cancellation_token: token,
        }
    }

    pub async fn run_background(&self, interval: chrono::Duration) -> Result<()> {
        let interval = interval.to_std()?;

        let sleeper = tokio::time::sleep(interval);
        tokio::pin!(sleeper);

        loop {
            tokio::select! {
            () = self.cancellation_token.cancelled() => {
                break;
            },
            () = &mut sleeper => {
                    if let Err(err) = self.main().await {
                        tracing::error!("CompactionTask task failed: {}", err);
                    }
                sleeper.as_mut().reset(tokio::time::Instant::now() + interval);
            }
            }
        }
        Ok(())
    }

    pub async fn main(&self) -> WireResult<()> {
        let expired = self.kv.purge_expired().await?;
        if expired > 0 {
            tracing::debug!(expired, "expired kv rows purged");
        }

        let cutoff = Utc::now() - self.retention;
        let mut cursor = None;
        let mut removed = 0;

        loop {
            let scan = self.kv.list("post:", 100, cursor).await?;
            for key in &scan.keys {
                let Some(post) = kv::get_json::<Post>(self.kv.as_ref(), key).await? else {
                    continue;
                };
                let deleted_long_ago = post.is_deleted
                    && post.deleted_at.map(|at| at < cutoff).unwrap_or(false);
                let taken_down_long_ago = post.is_taken_down
                    && post.taken_down_at.map(|at| at < cutoff).unwrap_or(false);
                if deleted_long_ago || taken_down_long_ago {
                    self.kv.delete(key).await?;
                    self.post_actors.remove(&post.id).await?;
                    removed += 1;
                }
            }
            if scan.done {
                break;
            }
            cursor = scan.next_cursor;
        }

        if removed > 0 {
            tracing::debug!(removed, "retained post records compacted");
        }
        Ok(())
    }
}
