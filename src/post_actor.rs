use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actor::ActorHost;
use crate::errors::{WireError, WireResult};
use crate::kv::{self, KvStore};
use crate::model::{post_key, Post};

pub const POST_NAMESPACE: &str = "post-state";

/// Authoritative per-post engagement. The likedBy/repostedBy sets are the
/// source of truth; counts in the cached `post:{id}` record are derived from
/// their sizes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostActorState {
    pub post: Post,
    pub liked_by: BTreeSet<String>,
    pub reposted_by: BTreeSet<String>,
    pub reply_count: u64,
    pub quote_count: u64,
    pub is_deleted: bool,
}

impl PostActorState {
    pub fn new(post: Post) -> Self {
        Self {
            post,
            liked_by: BTreeSet::new(),
            reposted_by: BTreeSet::new(),
            reply_count: 0,
            quote_count: 0,
            is_deleted: false,
        }
    }
}

#[derive(Clone)]
pub struct PostActors {
    host: Arc<ActorHost<PostActorState>>,
    kv: Arc<dyn KvStore>,
}

impl PostActors {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            host: ActorHost::new(kv.clone(), POST_NAMESPACE),
            kv,
        }
    }

    pub async fn initialize(&self, post: Post) -> WireResult<()> {
        let id = post.id.clone();
        self.host.init(&id, PostActorState::new(post)).await
    }

    pub async fn get(&self, post_id: &str) -> WireResult<PostActorState> {
        self.host.read(post_id, |state| state.clone()).await
    }

    /// Overwrite the cached record's counters from the committed actor
    /// state. Runs inside the actor's critical section, so writebacks land
    /// in actor-operation order and the cache converges on the
    /// authoritative counts; an in-place increment would not.
    async fn reconcile_record(&self, state: PostActorState) -> WireResult<()> {
        let key = post_key(&state.post.id);
        let Some(mut record) = kv::get_json::<Post>(self.kv.as_ref(), &key).await? else {
            // Record not written yet (mid-create) or already compacted.
            return Ok(());
        };
        record.like_count = state.liked_by.len() as u64;
        record.repost_count = state.reposted_by.len() as u64;
        record.reply_count = state.reply_count;
        record.quote_count = state.quote_count;
        kv::put_json(self.kv.as_ref(), &key, &record, None).await
    }

    fn guard_live(state: &PostActorState) -> WireResult<()> {
        if state.is_deleted {
            return Err(WireError::not_found("post"));
        }
        Ok(())
    }

    /// Idempotent. Returns the authoritative like count.
    pub async fn like(&self, post_id: &str, user_id: &str) -> WireResult<u64> {
        let user_id = user_id.to_string();
        self.host
            .update_then(
                post_id,
                move |state| {
                    Self::guard_live(state)?;
                    state.liked_by.insert(user_id);
                    Ok(state.liked_by.len() as u64)
                },
                |committed| async move { self.reconcile_record(committed).await },
            )
            .await
    }

    pub async fn unlike(&self, post_id: &str, user_id: &str) -> WireResult<u64> {
        let user_id = user_id.to_string();
        self.host
            .update_then(
                post_id,
                move |state| {
                    state.liked_by.remove(&user_id);
                    Ok(state.liked_by.len() as u64)
                },
                |committed| async move { self.reconcile_record(committed).await },
            )
            .await
    }

    pub async fn has_liked(&self, post_id: &str, user_id: &str) -> WireResult<bool> {
        self.host
            .read(post_id, |state| state.liked_by.contains(user_id))
            .await
    }

    pub async fn repost(&self, post_id: &str, user_id: &str) -> WireResult<u64> {
        let user_id = user_id.to_string();
        self.host
            .update_then(
                post_id,
                move |state| {
                    Self::guard_live(state)?;
                    state.reposted_by.insert(user_id);
                    Ok(state.reposted_by.len() as u64)
                },
                |committed| async move { self.reconcile_record(committed).await },
            )
            .await
    }

    pub async fn unrepost(&self, post_id: &str, user_id: &str) -> WireResult<u64> {
        let user_id = user_id.to_string();
        self.host
            .update_then(
                post_id,
                move |state| {
                    state.reposted_by.remove(&user_id);
                    Ok(state.reposted_by.len() as u64)
                },
                |committed| async move { self.reconcile_record(committed).await },
            )
            .await
    }

    pub async fn has_reposted(&self, post_id: &str, user_id: &str) -> WireResult<bool> {
        self.host
            .read(post_id, |state| state.reposted_by.contains(user_id))
            .await
    }

    pub async fn increment_replies(&self, post_id: &str) -> WireResult<u64> {
        self.host
            .update_then(
                post_id,
                |state| {
                    Self::guard_live(state)?;
                    state.reply_count += 1;
                    Ok(state.reply_count)
                },
                |committed| async move { self.reconcile_record(committed).await },
            )
            .await
    }

    pub async fn increment_quotes(&self, post_id: &str) -> WireResult<u64> {
        self.host
            .update_then(
                post_id,
                |state| {
                    Self::guard_live(state)?;
                    state.quote_count += 1;
                    Ok(state.quote_count)
                },
                |committed| async move { self.reconcile_record(committed).await },
            )
            .await
    }

    /// Marks deleted and zeroes the authoritative counters.
    pub async fn delete(&self, post_id: &str) -> WireResult<()> {
        self.host
            .update_then(
                post_id,
                |state| {
                    state.is_deleted = true;
                    state.liked_by.clear();
                    state.reposted_by.clear();
                    state.reply_count = 0;
                    state.quote_count = 0;
                    Ok(())
                },
                |committed| async move { self.reconcile_record(committed).await },
            )
            .await
    }

    pub async fn is_deleted(&self, post_id: &str) -> WireResult<bool> {
        self.host.read(post_id, |state| state.is_deleted).await
    }

    /// Drops actor state entirely. Used by compaction after the retention
    /// window.
    pub async fn remove(&self, post_id: &str) -> WireResult<()> {
        self.host.remove(post_id).await
    }
}
