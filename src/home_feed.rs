use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ScoringConfig;
use crate::errors::WireResult;
use crate::feed_actor::{decode_cursor, encode_cursor, FeedActors};
use crate::ids::id_floor;
use crate::kv::{self, KvStore};
use crate::model::{
    matches_any_muted_word, post_key, user_posts_key, FeedResponse, FeedSource, MutedWord,
    MutedWordScope, Post, PostKind, EXPLORE_RANKED_KEY,
};
use crate::user_actor::{UserActors, UserContext};

const SELECTION_WINDOW: usize = 5;
const BACKFILL_FOLLOWEES: usize = 8;
const GLOBAL_SCAN_MAX: usize = 200;
const GLOBAL_SCAN_PAGE: usize = 50;
const GLOBAL_LOOKBACK_HOURS: i64 = 48;

struct Candidate {
    post: Post,
    source: FeedSource,
    score: f64,
}

/// Composes the home timeline: chronological follow content from the
/// viewer's FeedActor, merged with ranked discovery, filtered, scored and
/// diversified. Discovery injection never advances pagination; the returned
/// cursor is the FeedActor cursor.
#[derive(Clone)]
pub struct HomeFeedAssembler {
    kv: Arc<dyn KvStore>,
    users: UserActors,
    feeds: FeedActors,
    scoring: ScoringConfig,
}

/// Viewer-specific filter set, precomputed from the user context.
struct ViewerFilter {
    user_id: String,
    blocked: BTreeSet<String>,
    following: BTreeSet<String>,
    muted_all: Vec<String>,
    muted_not_following: Vec<String>,
}

impl ViewerFilter {
    fn new(user_id: &str, context: &UserContext) -> Self {
        let (muted_all, muted_not_following) = split_muted(&context.muted_words);
        Self {
            user_id: user_id.to_string(),
            blocked: context.blocked.clone(),
            following: context.following.clone(),
            muted_all,
            muted_not_following,
        }
    }

    fn passes(&self, post: &Post) -> bool {
        if !post.is_visible() {
            return false;
        }
        if self.blocked.contains(&post.author_id) {
            return false;
        }
        if matches_any_muted_word(&post.content, &self.muted_all) {
            return false;
        }
        let from_stranger =
            post.author_id != self.user_id && !self.following.contains(&post.author_id);
        if from_stranger && matches_any_muted_word(&post.content, &self.muted_not_following) {
            return false;
        }
        true
    }
}

fn split_muted(words: &[MutedWord]) -> (Vec<String>, Vec<String>) {
    let mut all = Vec::new();
    let mut not_following = Vec::new();
    for word in words {
        match word.scope {
            MutedWordScope::All => all.push(word.word.clone()),
            MutedWordScope::NotFollowing => not_following.push(word.word.clone()),
        }
    }
    (all, not_following)
}

/// A repost that adds nothing: no commentary and no engagement on what it
/// points at.
fn is_low_value_repost(post: &Post) -> bool {
    if !post.is_repost() || !post.content.is_empty() {
        return false;
    }
    let engagement = match &post.kind {
        PostKind::Repost {
            snapshot: Some(snapshot),
            ..
        } => snapshot.engagement(),
        _ => post.engagement(),
    };
    engagement == 0
}

impl HomeFeedAssembler {
    pub fn new(
        kv: Arc<dyn KvStore>,
        users: UserActors,
        feeds: FeedActors,
        scoring: ScoringConfig,
    ) -> Self {
        Self {
            kv,
            users,
            feeds,
            scoring,
        }
    }

    pub async fn assemble(
        &self,
        user_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> WireResult<FeedResponse> {
        let now = Utc::now();
        let context = self.users.context(user_id).await?;
        let filter = ViewerFilter::new(user_id, &context);

        let page = self
            .feeds
            .feed_with_posts(user_id, cursor, limit * 3)
            .await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut seen_originals: HashSet<String> = HashSet::new();
        let mut candidates: Vec<Candidate> = Vec::new();

        for (entry, post) in page.items {
            if !filter.passes(&post) {
                continue;
            }
            if is_low_value_repost(&post) {
                continue;
            }
            if let Some(original_id) = post.repost_of_id() {
                if !seen_originals.insert(original_id.to_string()) {
                    continue;
                }
            }
            if !seen.insert(post.id.clone()) {
                continue;
            }
            candidates.push(Candidate {
                post,
                source: entry.source,
                score: 0.0,
            });
        }

        self.append_discovery(&filter, &mut candidates, &mut seen, &mut seen_originals, limit)
            .await?;

        let target_unique_authors = context
            .following
            .len()
            .min(6.max(limit / 3))
            .max(1);
        self.backfill_diversity(&filter, &mut candidates, &mut seen, target_unique_authors)
            .await?;

        self.score(&mut candidates, now);

        let per_author_cap = 2.max(limit.div_ceil(target_unique_authors));
        let posts = select_diverse(candidates, limit, per_author_cap);

        Ok(FeedResponse {
            posts,
            cursor: page.cursor,
            has_more: page.has_more,
        })
    }

    /// Ranked discovery posts append as `fof` candidates; own and already
    /// seen posts are skipped.
    async fn append_discovery(
        &self,
        filter: &ViewerFilter,
        candidates: &mut Vec<Candidate>,
        seen: &mut HashSet<String>,
        seen_originals: &mut HashSet<String>,
        limit: usize,
    ) -> WireResult<()> {
        let ranked: Vec<Post> = kv::get_json(self.kv.as_ref(), EXPLORE_RANKED_KEY)
            .await?
            .unwrap_or_default();

        let mut taken = 0;
        for post in ranked {
            if taken == limit {
                break;
            }
            if post.author_id == filter.user_id || seen.contains(&post.id) {
                continue;
            }
            if !filter.passes(&post) || is_low_value_repost(&post) {
                continue;
            }
            if let Some(original_id) = post.repost_of_id() {
                if !seen_originals.insert(original_id.to_string()) {
                    continue;
                }
            }
            seen.insert(post.id.clone());
            candidates.push(Candidate {
                post,
                source: FeedSource::Fof,
                score: 0.0,
            });
            taken += 1;
        }
        Ok(())
    }

    /// When too few distinct authors made the cut, pull the most recent
    /// unseen post from a handful of under-represented followees.
    async fn backfill_diversity(
        &self,
        filter: &ViewerFilter,
        candidates: &mut Vec<Candidate>,
        seen: &mut HashSet<String>,
        target_unique_authors: usize,
    ) -> WireResult<()> {
        let mut represented: HashSet<String> = candidates
            .iter()
            .map(|c| c.post.author_id.clone())
            .collect();
        if represented.len() >= target_unique_authors {
            return Ok(());
        }

        let underrepresented: Vec<String> = filter
            .following
            .iter()
            .filter(|followee| !represented.contains(*followee))
            .take(BACKFILL_FOLLOWEES)
            .cloned()
            .collect();

        for followee in underrepresented {
            if represented.len() >= target_unique_authors {
                break;
            }
            let post_ids: Vec<String> = kv::get_json(self.kv.as_ref(), &user_posts_key(&followee))
                .await?
                .unwrap_or_default();

            for post_id in post_ids {
                if seen.contains(&post_id) {
                    continue;
                }
                let Some(post) =
                    kv::get_json::<Post>(self.kv.as_ref(), &post_key(&post_id)).await?
                else {
                    continue;
                };
                if !filter.passes(&post) || is_low_value_repost(&post) {
                    continue;
                }
                seen.insert(post.id.clone());
                represented.insert(post.author_id.clone());
                candidates.push(Candidate {
                    post,
                    source: FeedSource::Follow,
                    score: 0.0,
                });
                break;
            }
        }
        Ok(())
    }

    fn score(&self, candidates: &mut [Candidate], now: DateTime<Utc>) {
        let mut author_freq: HashMap<&str, u64> = HashMap::new();
        for candidate in candidates.iter() {
            *author_freq.entry(candidate.post.author_id.as_str()).or_default() += 1;
        }
        let author_freq: HashMap<String, u64> = author_freq
            .into_iter()
            .map(|(author, count)| (author.to_string(), count))
            .collect();

        for candidate in candidates.iter_mut() {
            let post = &candidate.post;

            // The reader-side variant of the discovery score also counts
            // quotes as reposts.
            let numerator = post.like_count as f64 * self.scoring.like_weight
                + post.reply_count as f64 * self.scoring.reply_weight
                + (post.repost_count + post.quote_count) as f64 * self.scoring.repost_weight;
            let hn = numerator
                / (post.age_hours(now) + self.scoring.base_offset).powf(self.scoring.exp);

            let engagement = (post.engagement() as f64 + 1.0).log10();
            let recency = 1.0 / (post.age_hours(now) + 1.0);
            let source_boost = match candidate.source {
                FeedSource::Own => 0.2,
                FeedSource::Follow => 0.1,
                FeedSource::Fof => 0.0,
            };
            let empty_repost_penalty = if post.is_repost() && post.content.is_empty() {
                0.4
            } else {
                0.0
            };
            let freq = author_freq.get(&post.author_id).copied().unwrap_or(1);
            let frequency_penalty = (0.05 * (freq.saturating_sub(1)) as f64).min(0.6);

            candidate.score = 4.0 * hn + 2.0 * engagement + recency + source_boost
                - empty_repost_penalty
                - frequency_penalty;
        }
    }

    /// Chronological timeline: the viewer's FeedActor entries with block and
    /// all-scope mute filtering. Scope `not_following` never applies here,
    /// feed entries only come from followed authors and the viewer.
    pub async fn chronological(
        &self,
        user_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> WireResult<FeedResponse> {
        let context = self.users.context(user_id).await?;
        let (muted_all, _) = split_muted(&context.muted_words);

        let page = self
            .feeds
            .feed(user_id, cursor, limit, &context.blocked, &muted_all)
            .await?;

        Ok(FeedResponse {
            posts: page.items.into_iter().map(|(_, post)| post).collect(),
            cursor: page.cursor,
            has_more: page.has_more,
        })
    }

    /// Site-wide latest notes, bounded scan, viewer filters applied.
    pub async fn global(
        &self,
        user_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> WireResult<FeedResponse> {
        let context = self.users.context(user_id).await?;
        let filter = ViewerFilter::new(user_id, &context);

        let floor = post_key(&id_floor(
            Utc::now() - chrono::Duration::hours(GLOBAL_LOOKBACK_HOURS),
        ));
        let mut scan_cursor = Some(floor);
        let mut posts: Vec<Post> = Vec::new();

        loop {
            let scan = self.kv.list("post:", GLOBAL_SCAN_PAGE, scan_cursor).await?;
            for key in &scan.keys {
                if posts.len() == GLOBAL_SCAN_MAX {
                    break;
                }
                let Some(post) = kv::get_json::<Post>(self.kv.as_ref(), key).await? else {
                    continue;
                };
                if filter.passes(&post) && !is_low_value_repost(&post) {
                    posts.push(post);
                }
            }
            if scan.done || posts.len() >= GLOBAL_SCAN_MAX {
                break;
            }
            scan_cursor = scan.next_cursor;
        }

        posts.sort_by(|a, b| b.id.cmp(&a.id));

        let start = decode_cursor(&cursor);
        let window: Vec<Post> = posts.iter().skip(start).take(limit).cloned().collect();
        let has_more = start + window.len() < posts.len();
        let cursor = if has_more {
            Some(encode_cursor(start + window.len()))
        } else {
            None
        };

        Ok(FeedResponse {
            posts: window,
            cursor,
            has_more,
        })
    }
}

fn count_in_window(selected: &[Post], author: &str) -> usize {
    let window_start = selected.len().saturating_sub(SELECTION_WINDOW - 1);
    selected[window_start..]
        .iter()
        .filter(|post| post.author_id == author)
        .count()
}

/// Two-pass windowed selection. The first pass holds every author to one
/// slot per window and `per_author_cap` total; the spill pass relaxes to two
/// per window and twice the cap so the page still fills when few authors are
/// available.
fn select_diverse(mut candidates: Vec<Candidate>, limit: usize, per_author_cap: usize) -> Vec<Post> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.post.id.cmp(&a.post.id))
    });

    let mut selected: Vec<Post> = Vec::with_capacity(limit);
    let mut author_totals: HashMap<String, usize> = HashMap::new();
    let mut spill: Vec<Candidate> = Vec::new();

    for candidate in candidates {
        if selected.len() == limit {
            return selected;
        }
        let author = candidate.post.author_id.clone();
        let total = author_totals.get(&author).copied().unwrap_or(0);
        if total < per_author_cap && count_in_window(&selected, &author) < 1 {
            author_totals.insert(author, total + 1);
            selected.push(candidate.post);
        } else {
            spill.push(candidate);
        }
    }

    for candidate in spill {
        if selected.len() == limit {
            break;
        }
        let author = candidate.post.author_id.clone();
        let total = author_totals.get(&author).copied().unwrap_or(0);
        if total < per_author_cap * 2 && count_in_window(&selected, &author) < 2 {
            author_totals.insert(author, total + 1);
            selected.push(candidate.post);
        }
    }

    selected
}
