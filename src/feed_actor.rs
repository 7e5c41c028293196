use std::collections::BTreeSet;
use std::sync::Arc;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actor::ActorHost;
use crate::errors::WireResult;
use crate::kv::{self, KvStore};
use crate::model::{
    matches_any_muted_word, post_key, FeedEntry, Post, MAX_FEED_ENTRIES,
};

pub const FEED_NAMESPACE: &str = "feed";

/// Per-user timeline: newest-first entries, unique by post id, bounded.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeedState {
    pub entries: Vec<FeedEntry>,
}

/// One page of a feed read, entries joined with their post records.
#[derive(Clone, Debug)]
pub struct FeedPage {
    pub items: Vec<(FeedEntry, Post)>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Cursor tokens are opaque to clients; internally they encode an index into
/// the sequence being paged. Unparseable cursors restart from the top.
pub fn encode_cursor(index: usize) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(format!("idx:{}", index))
}

pub fn decode_cursor(cursor: &Option<String>) -> usize {
    cursor
        .as_ref()
        .and_then(|raw| BASE64_URL_SAFE_NO_PAD.decode(raw).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| text.strip_prefix("idx:").and_then(|n| n.parse().ok()))
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct FeedActors {
    host: Arc<ActorHost<FeedState>>,
    kv: Arc<dyn KvStore>,
}

impl FeedActors {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            host: ActorHost::new(kv.clone(), FEED_NAMESPACE),
            kv,
        }
    }

    // Feeds are created implicitly on first append rather than by an
    // explicit client call.
    async fn ensure(&self, user_id: &str) -> WireResult<()> {
        if !self.host.exists(user_id).await? {
            match self.host.init(user_id, FeedState::default()).await {
                Ok(()) => {}
                Err(crate::errors::WireError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Idempotent by post id; prepends and truncates the tail past the cap.
    pub async fn add_entry(&self, user_id: &str, entry: FeedEntry) -> WireResult<bool> {
        self.ensure(user_id).await?;
        self.host
            .update(user_id, move |state| {
                if state.entries.iter().any(|e| e.post_id == entry.post_id) {
                    return Ok(false);
                }
                state.entries.insert(0, entry);
                state.entries.truncate(MAX_FEED_ENTRIES);
                Ok(true)
            })
            .await
    }

    pub async fn remove_entry(&self, user_id: &str, post_id: &str) -> WireResult<bool> {
        self.ensure(user_id).await?;
        let post_id = post_id.to_string();
        self.host
            .update(user_id, move |state| {
                let before = state.entries.len();
                state.entries.retain(|e| e.post_id != post_id);
                Ok(state.entries.len() != before)
            })
            .await
    }

    pub async fn clear(&self, user_id: &str) -> WireResult<()> {
        self.ensure(user_id).await?;
        self.host
            .update(user_id, |state| {
                state.entries.clear();
                Ok(())
            })
            .await
    }

    pub async fn count(&self, user_id: &str) -> WireResult<usize> {
        Ok(self
            .host
            .try_read(user_id, |state| state.entries.len())
            .await?
            .unwrap_or(0))
    }

    pub async fn entries(&self, user_id: &str) -> WireResult<Vec<FeedEntry>> {
        Ok(self
            .host
            .try_read(user_id, |state| state.entries.clone())
            .await?
            .unwrap_or_default())
    }

    /// Drop entries older than `cutoff`. Returns how many were removed.
    pub async fn prune_older_than(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> WireResult<usize> {
        self.ensure(user_id).await?;
        self.host
            .update(user_id, move |state| {
                let before = state.entries.len();
                state.entries.retain(|e| e.timestamp >= cutoff);
                Ok(before - state.entries.len())
            })
            .await
    }

    /// Filtered, paginated window. Blocked authors are dropped without a
    /// fetch; muted-word filtering needs each candidate's record, and a
    /// failed fetch drops the entry (fail-closed). The cursor indexes the
    /// filtered sequence.
    pub async fn feed(
        &self,
        user_id: &str,
        cursor: Option<String>,
        limit: usize,
        blocked: &BTreeSet<String>,
        muted: &[String],
    ) -> WireResult<FeedPage> {
        let entries = self.entries(user_id).await?;
        let start = decode_cursor(&cursor);

        let mut items = Vec::with_capacity(limit);
        let mut filtered_index = 0usize;
        let mut has_more = false;

        for entry in entries {
            if blocked.contains(&entry.author_id) {
                continue;
            }
            let post = match kv::get_json::<Post>(self.kv.as_ref(), &post_key(&entry.post_id))
                .await
            {
                Ok(Some(post)) => post,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(post_id = %entry.post_id, error = ?err, "dropping entry on fetch failure");
                    continue;
                }
            };
            if !post.is_visible() {
                continue;
            }
            if matches_any_muted_word(&post.content, muted) {
                continue;
            }

            if filtered_index >= start {
                if items.len() == limit {
                    has_more = true;
                    break;
                }
                items.push((entry, post));
            }
            filtered_index += 1;
        }

        let cursor = if has_more {
            Some(encode_cursor(start + items.len()))
        } else {
            None
        };
        Ok(FeedPage {
            items,
            cursor,
            has_more,
        })
    }

    /// Unfiltered window joined with post records, for the home-feed
    /// assembler, which applies its own richer filters. Entries whose record
    /// cannot be fetched are dropped (fail-closed); the cursor indexes the
    /// raw entry list so pagination is independent of filtering.
    pub async fn feed_with_posts(
        &self,
        user_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> WireResult<FeedPage> {
        let entries = self.entries(user_id).await?;
        let start = decode_cursor(&cursor);

        let total = entries.len();
        let mut items = Vec::new();
        let mut consumed = start;

        for entry in entries.into_iter().skip(start) {
            if items.len() == limit {
                break;
            }
            consumed += 1;
            match kv::get_json::<Post>(self.kv.as_ref(), &post_key(&entry.post_id)).await {
                Ok(Some(post)) => items.push((entry, post)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(post_id = %entry.post_id, error = ?err, "dropping entry on fetch failure");
                }
            }
        }

        let has_more = consumed < total;
        let cursor = if has_more {
            Some(encode_cursor(consumed))
        } else {
            None
        };
        Ok(FeedPage {
            items,
            cursor,
            has_more,
        })
    }
}
