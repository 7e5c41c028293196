use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::collab::{Notifier, SearchIndex};
use crate::errors::{WireError, WireResult};
use crate::feed_actor::FeedActors;
use crate::ids::new_id;
use crate::kv::{self, KvStore};
use crate::model::{
    post_key, replies_key, user_posts_key, FeedEntry, FeedSource, Post, PostKind,
    MAX_USER_POSTS_INDEX,
};
use crate::post_actor::PostActors;
use crate::queue::{FanoutMessage, Queue};
use crate::user_actor::UserActors;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub reply_to_id: Option<String>,
    pub quote_of_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    pub ancestors: Vec<Post>,
    pub post: Post,
    pub replies: Vec<Post>,
}

/// Orchestrates post writes across the actors, the cached records and the
/// fan-out queue. Cached counter fields are always overwritten with the
/// actor-returned value; an optimistic in-place increment would drift under
/// concurrency.
#[derive(Clone)]
pub struct PostService {
    kv: Arc<dyn KvStore>,
    queue: Arc<dyn Queue>,
    users: UserActors,
    post_actors: PostActors,
    feeds: FeedActors,
    search: Arc<dyn SearchIndex>,
    notifier: Arc<dyn Notifier>,
    max_note_length: usize,
    max_thread_depth: usize,
}

impl PostService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn Queue>,
        users: UserActors,
        post_actors: PostActors,
        feeds: FeedActors,
        search: Arc<dyn SearchIndex>,
        notifier: Arc<dyn Notifier>,
        max_note_length: usize,
        max_thread_depth: usize,
    ) -> Self {
        Self {
            kv,
            queue,
            users,
            post_actors,
            feeds,
            search,
            notifier,
            max_note_length,
            max_thread_depth,
        }
    }

    pub async fn create(&self, author_id: &str, request: CreatePostRequest) -> WireResult<Post> {
        let author = self.users.get(author_id).await?;
        if author.profile.is_banned {
            return Err(WireError::forbidden("account is banned"));
        }

        let content = request.content.trim().to_string();
        if content.is_empty() {
            return Err(WireError::validation("note must not be empty"));
        }
        if content.chars().count() > self.max_note_length {
            return Err(WireError::validation(format!(
                "note must be at most {} characters",
                self.max_note_length
            )));
        }
        if request.reply_to_id.is_some() && request.quote_of_id.is_some() {
            return Err(WireError::validation(
                "a note cannot be both a reply and a quote",
            ));
        }

        let mut parent_author = None;
        let kind = if let Some(parent_id) = &request.reply_to_id {
            let parent = self.visible_post(parent_id).await?;
            self.forbid_if_blocked(&parent.author_id, author_id).await?;
            parent_author = Some(parent.author_id);
            PostKind::Reply {
                parent_id: parent.id,
            }
        } else if let Some(quoted_id) = &request.quote_of_id {
            let quoted = self.visible_post(quoted_id).await?;
            self.forbid_if_blocked(&quoted.author_id, author_id).await?;
            PostKind::Quote {
                quoted_id: quoted.id,
            }
        } else {
            PostKind::Original
        };

        let now = Utc::now();
        let post = Post {
            id: new_id(),
            author_id: author.id.clone(),
            author_handle: author.handle.clone(),
            author_display_name: author.profile.display_name.clone(),
            author_avatar_url: author.profile.avatar_url.clone(),
            content,
            media_urls: request.media_urls,
            kind: kind.clone(),
            created_at: now,
            like_count: 0,
            reply_count: 0,
            repost_count: 0,
            quote_count: 0,
            is_deleted: false,
            deleted_at: None,
            is_taken_down: false,
            taken_down_at: None,
            taken_down_reason: None,
        };

        self.materialize(&post).await?;

        match kind {
            PostKind::Reply { parent_id } => {
                self.post_actors.increment_replies(&parent_id).await?;
                self.append_index(&replies_key(&parent_id), &post.id).await?;
                if let Some(parent_author) = &parent_author {
                    self.notifier.reply(parent_author, &post).await;
                }
            }
            PostKind::Quote { quoted_id } => {
                self.post_actors.increment_quotes(&quoted_id).await?;
            }
            _ => {}
        }

        self.notify_mentions(&post).await;
        Ok(post)
    }

    pub async fn repost(&self, reposter_id: &str, target_id: &str) -> WireResult<Post> {
        let target = self.visible_post(target_id).await?;
        self.forbid_if_blocked(&target.author_id, reposter_id)
            .await?;

        if self.post_actors.has_reposted(target_id, reposter_id).await? {
            return Err(WireError::conflict("already reposted"));
        }

        let reposter = self.users.get(reposter_id).await?;
        if reposter.profile.is_banned {
            return Err(WireError::forbidden("account is banned"));
        }

        // Snapshot carries the target author's display fields as they are
        // now, not as they were at target creation.
        let mut snapshot = target.clone();
        if let Ok(author) = self.users.get(&target.author_id).await {
            snapshot.author_handle = author.handle.clone();
            snapshot.author_display_name = author.profile.display_name.clone();
            snapshot.author_avatar_url = author.profile.avatar_url.clone();
        }

        let post = Post {
            id: new_id(),
            author_id: reposter.id.clone(),
            author_handle: reposter.handle.clone(),
            author_display_name: reposter.profile.display_name.clone(),
            author_avatar_url: reposter.profile.avatar_url.clone(),
            content: String::new(),
            media_urls: Vec::new(),
            kind: PostKind::Repost {
                original_id: target.id.clone(),
                snapshot: Some(Box::new(snapshot)),
            },
            created_at: Utc::now(),
            like_count: 0,
            reply_count: 0,
            repost_count: 0,
            quote_count: 0,
            is_deleted: false,
            deleted_at: None,
            is_taken_down: false,
            taken_down_at: None,
            taken_down_reason: None,
        };

        self.materialize(&post).await?;

        // The actor mirrors the authoritative repost count into the target's
        // cached record.
        self.post_actors.repost(target_id, reposter_id).await?;

        self.notifier.repost(&target.author_id, &post).await;
        Ok(post)
    }

    /// The shared tail of every post creation: actor init, cached record,
    /// author index, search, own feed, fan-out, post count.
    async fn materialize(&self, post: &Post) -> WireResult<()> {
        self.post_actors.initialize(post.clone()).await?;
        self.write_record(post).await?;
        self.prepend_index(&user_posts_key(&post.author_id), &post.id)
            .await?;
        self.search.index_post(post).await;

        self.feeds
            .add_entry(
                &post.author_id,
                FeedEntry {
                    post_id: post.id.clone(),
                    author_id: post.author_id.clone(),
                    timestamp: post.created_at,
                    source: FeedSource::Own,
                },
            )
            .await?;

        self.enqueue(&FanoutMessage::NewPost {
            post_id: post.id.clone(),
            author_id: post.author_id.clone(),
            timestamp: post.created_at,
            targets: None,
        })
        .await?;

        self.users.posts_increment(&post.author_id).await?;
        Ok(())
    }

    pub async fn delete(&self, author_id: &str, post_id: &str) -> WireResult<()> {
        let post = self.load_post(post_id).await?;
        if post.author_id != author_id {
            return Err(WireError::forbidden("only the author can delete a note"));
        }
        if post.is_deleted {
            return Ok(());
        }

        self.post_actors.delete(post_id).await?;
        self.update_record(post_id, |record| {
            record.is_deleted = true;
            record.deleted_at = Some(Utc::now());
            record.like_count = 0;
            record.reply_count = 0;
            record.repost_count = 0;
            record.quote_count = 0;
        })
        .await?;

        // Deleting a repost releases the repost edge on the original.
        if let Some(original_id) = post.repost_of_id() {
            if self.post_actors.has_reposted(original_id, author_id).await? {
                self.post_actors.unrepost(original_id, author_id).await?;
            }
        }

        self.enqueue(&FanoutMessage::DeletePost {
            post_id: post_id.to_string(),
            author_id: author_id.to_string(),
            targets: None,
        })
        .await?;

        self.users.posts_decrement(author_id).await?;
        self.search.remove_post(post_id).await;
        self.feeds.remove_entry(author_id, post_id).await?;
        Ok(())
    }

    /// Idempotent; returns the authoritative like count. The actor mirrors
    /// it into the cached record before the call returns.
    pub async fn like(&self, user_id: &str, post_id: &str) -> WireResult<u64> {
        self.visible_post(post_id).await?;
        let like_count = self.post_actors.like(post_id, user_id).await?;
        self.users.liked_posts_add(user_id, post_id).await?;
        Ok(like_count)
    }

    pub async fn unlike(&self, user_id: &str, post_id: &str) -> WireResult<u64> {
        self.load_post(post_id).await?;
        let like_count = self.post_actors.unlike(post_id, user_id).await?;
        self.users.liked_posts_remove(user_id, post_id).await?;
        Ok(like_count)
    }

    /// Removes the repost edge and the repost record it created.
    pub async fn unrepost(&self, user_id: &str, target_id: &str) -> WireResult<u64> {
        self.load_post(target_id).await?;

        let repost_count = self.post_actors.unrepost(target_id, user_id).await?;

        if let Some(repost_id) = self.find_repost(user_id, target_id).await? {
            self.delete(user_id, &repost_id).await?;
        }
        Ok(repost_count)
    }

    async fn find_repost(&self, user_id: &str, target_id: &str) -> WireResult<Option<String>> {
        let post_ids = self.user_posts(user_id).await?;
        for post_id in post_ids {
            if let Some(post) = kv::get_json::<Post>(self.kv.as_ref(), &post_key(&post_id)).await?
            {
                if !post.is_deleted && post.repost_of_id() == Some(target_id) {
                    return Ok(Some(post.id));
                }
            }
        }
        Ok(None)
    }

    pub async fn get_post(&self, post_id: &str) -> WireResult<Post> {
        self.load_post(post_id).await
    }

    pub async fn replies(&self, post_id: &str) -> WireResult<Vec<Post>> {
        self.load_post(post_id).await?;
        let reply_ids: Vec<String> = kv::get_json(self.kv.as_ref(), &replies_key(post_id))
            .await?
            .unwrap_or_default();

        let mut replies = Vec::with_capacity(reply_ids.len());
        for reply_id in reply_ids {
            if let Some(post) = kv::get_json::<Post>(self.kv.as_ref(), &post_key(&reply_id)).await?
            {
                if post.is_visible() {
                    replies.push(post);
                }
            }
        }
        Ok(replies)
    }

    /// Parent chain (oldest first, capped) plus direct replies.
    pub async fn thread(&self, post_id: &str) -> WireResult<ThreadView> {
        let post = self.load_post(post_id).await?;

        let mut ancestors = Vec::new();
        let mut current = post.clone();
        for _ in 0..self.max_thread_depth {
            let Some(parent_id) = current.parent_id().map(str::to_string) else {
                break;
            };
            let Some(parent) =
                kv::get_json::<Post>(self.kv.as_ref(), &post_key(&parent_id)).await?
            else {
                break;
            };
            ancestors.insert(0, parent.clone());
            current = parent;
        }

        let replies = self.replies(post_id).await?;
        Ok(ThreadView {
            ancestors,
            post,
            replies,
        })
    }

    pub async fn user_posts(&self, user_id: &str) -> WireResult<Vec<String>> {
        Ok(kv::get_json(self.kv.as_ref(), &user_posts_key(user_id))
            .await?
            .unwrap_or_default())
    }

    async fn load_post(&self, post_id: &str) -> WireResult<Post> {
        kv::get_json(self.kv.as_ref(), &post_key(post_id))
            .await?
            .ok_or_else(|| WireError::not_found("post"))
    }

    async fn visible_post(&self, post_id: &str) -> WireResult<Post> {
        let post = self.load_post(post_id).await?;
        if !post.is_visible() {
            return Err(WireError::not_found("post"));
        }
        Ok(post)
    }

    async fn forbid_if_blocked(&self, owner_id: &str, actor_id: &str) -> WireResult<()> {
        if self.users.is_blocked(owner_id, actor_id).await? {
            return Err(WireError::forbidden("you are blocked by this user"));
        }
        Ok(())
    }

    async fn write_record(&self, post: &Post) -> WireResult<()> {
        kv::put_json(self.kv.as_ref(), &post_key(&post.id), post, None).await
    }

    async fn update_record(&self, post_id: &str, f: impl FnOnce(&mut Post)) -> WireResult<Post> {
        let mut post = self.load_post(post_id).await?;
        f(&mut post);
        self.write_record(&post).await?;
        Ok(post)
    }

    async fn prepend_index(&self, key: &str, id: &str) -> WireResult<()> {
        let mut ids: Vec<String> = kv::get_json(self.kv.as_ref(), key).await?.unwrap_or_default();
        ids.retain(|existing| existing != id);
        ids.insert(0, id.to_string());
        ids.truncate(MAX_USER_POSTS_INDEX);
        kv::put_json(self.kv.as_ref(), key, &ids, None).await
    }

    async fn append_index(&self, key: &str, id: &str) -> WireResult<()> {
        let mut ids: Vec<String> = kv::get_json(self.kv.as_ref(), key).await?.unwrap_or_default();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
        kv::put_json(self.kv.as_ref(), key, &ids, None).await
    }

    // Enqueues are idempotent downstream, so a transient failure gets one
    // more attempt before surfacing.
    async fn enqueue(&self, message: &FanoutMessage) -> WireResult<()> {
        match self.queue.send(message).await {
            Err(err) if err.is_transient() => self.queue.send(message).await,
            other => other,
        }
    }

    async fn notify_mentions(&self, post: &Post) {
        for handle in extract_mentions(&post.content) {
            let key = crate::model::handle_key(&handle);
            match kv::get_json::<String>(self.kv.as_ref(), &key).await {
                Ok(Some(user_id)) if user_id != post.author_id => {
                    self.notifier.mention(&user_id, post).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(handle = %handle, error = ?err, "mention lookup failed");
                }
            }
        }
    }
}

/// `@handle` occurrences, lowercased and deduplicated, in order of first
/// appearance.
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let mut chars = content.char_indices().peekable();
    let mut prev: Option<char> = None;

    while let Some((at, c)) = chars.next() {
        if c == '@' && prev.map(|p| !p.is_alphanumeric() && p != '_').unwrap_or(true) {
            let rest = &content[at + 1..];
            let handle: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .take(15)
                .collect::<String>()
                .to_lowercase();
            if handle.len() >= 3 && !mentions.contains(&handle) {
                mentions.push(handle);
            }
        }
        prev = Some(c);
    }
    mentions
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::collab::LogCollaborators;
    use crate::kv::MemoryKv;
    use crate::model::{email_key, handle_key};
    use crate::queue::MemoryQueue;
    use crate::user_actor::tests::user_state;

    pub(crate) struct Fixture {
        pub kv: Arc<dyn KvStore>,
        pub queue: Arc<dyn Queue>,
        pub users: UserActors,
        pub post_actors: PostActors,
        pub feeds: FeedActors,
        pub service: PostService,
    }

    pub(crate) fn fixture() -> Fixture {
        let kv = MemoryKv::shared();
        let queue = MemoryQueue::shared();
        let users = UserActors::new(kv.clone());
        let post_actors = PostActors::new(kv.clone());
        let feeds = FeedActors::new(kv.clone());
        let service = PostService::new(
            kv.clone(),
            queue.clone(),
            users.clone(),
            post_actors.clone(),
            feeds.clone(),
            LogCollaborators::search(),
            LogCollaborators::notifier(),
            280,
            10,
        );
        Fixture {
            kv,
            queue,
            users,
            post_actors,
            feeds,
            service,
        }
    }

    pub(crate) async fn register(fx: &Fixture, id: &str, handle: &str) {
        fx.users.initialize(user_state(id, handle)).await.unwrap();
        kv::put_json(
            fx.kv.as_ref(),
            &handle_key(handle),
            &id.to_string(),
            None,
        )
        .await
        .unwrap();
        kv::put_json(
            fx.kv.as_ref(),
            &email_key(&format!("{}@wire.example", handle)),
            &id.to_string(),
            None,
        )
        .await
        .unwrap();
    }

    fn note(content: &str) -> CreatePostRequest {
        CreatePostRequest {
            content: content.to_string(),
            ..CreatePostRequest::default()
        }
    }

    #[tokio::test]
    async fn create_round_trips_and_updates_indices() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;

        let post = fx.service.create("u1", note("hello")).await.unwrap();
        let fetched = fx.service.get_post(&post.id).await.unwrap();
        assert_eq!(fetched, post);

        assert_eq!(fx.service.user_posts("u1").await.unwrap(), vec![post.id.clone()]);
        assert_eq!(fx.users.profile("u1").await.unwrap().post_count, 1);

        let entries = fx.feeds.entries("u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, FeedSource::Own);

        let batch = fx.queue.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(
            batch[0].message,
            FanoutMessage::NewPost { .. }
        ));
    }

    #[tokio::test]
    async fn create_validation() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;

        assert!(matches!(
            fx.service.create("u1", note("   ")).await.unwrap_err(),
            WireError::Validation(_)
        ));
        assert!(matches!(
            fx.service
                .create("u1", note(&"x".repeat(281)))
                .await
                .unwrap_err(),
            WireError::Validation(_)
        ));

        let both = CreatePostRequest {
            content: "hi".to_string(),
            reply_to_id: Some("a".to_string()),
            quote_of_id: Some("b".to_string()),
            ..CreatePostRequest::default()
        };
        assert!(matches!(
            fx.service.create("u1", both).await.unwrap_err(),
            WireError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn banned_author_cannot_post() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        fx.users.ban("u1", "abuse").await.unwrap();
        assert!(matches!(
            fx.service.create("u1", note("hi")).await.unwrap_err(),
            WireError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn reply_updates_parent_counts_and_index() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        register(&fx, "u2", "bob").await;

        let parent = fx.service.create("u1", note("parent")).await.unwrap();
        let reply = fx
            .service
            .create(
                "u2",
                CreatePostRequest {
                    content: "child".to_string(),
                    reply_to_id: Some(parent.id.clone()),
                    ..CreatePostRequest::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(reply.parent_id(), Some(parent.id.as_str()));
        assert_eq!(fx.service.get_post(&parent.id).await.unwrap().reply_count, 1);

        let replies = fx.service.replies(&parent.id).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, reply.id);

        let thread = fx.service.thread(&reply.id).await.unwrap();
        assert_eq!(thread.ancestors.len(), 1);
        assert_eq!(thread.ancestors[0].id, parent.id);
    }

    #[tokio::test]
    async fn reply_to_blocked_author_is_forbidden() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        register(&fx, "u2", "bob").await;
        fx.users.block("u1", "u2").await.unwrap();

        let parent = fx.service.create("u1", note("parent")).await.unwrap();
        let err = fx
            .service
            .create(
                "u2",
                CreatePostRequest {
                    content: "child".to_string(),
                    reply_to_id: Some(parent.id.clone()),
                    ..CreatePostRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Forbidden(_)));
    }

    #[tokio::test]
    async fn double_repost_conflicts() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        register(&fx, "u2", "bob").await;

        let target = fx.service.create("u2", note("original")).await.unwrap();
        let repost = fx.service.repost("u1", &target.id).await.unwrap();
        assert!(repost.content.is_empty());
        assert_eq!(repost.repost_of_id(), Some(target.id.as_str()));

        assert_eq!(fx.service.get_post(&target.id).await.unwrap().repost_count, 1);

        let err = fx.service.repost("u1", &target.id).await.unwrap_err();
        assert!(matches!(err, WireError::Conflict(_)));
    }

    #[tokio::test]
    async fn repost_snapshot_tracks_current_author_profile() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        register(&fx, "u2", "bob").await;

        let target = fx.service.create("u2", note("original")).await.unwrap();
        fx.users
            .update_profile(
                "u2",
                crate::user_actor::ProfilePatch {
                    display_name: Some("Robert".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let repost = fx.service.repost("u1", &target.id).await.unwrap();
        match &repost.kind {
            PostKind::Repost { snapshot, .. } => {
                assert_eq!(
                    snapshot.as_ref().unwrap().author_display_name,
                    "Robert"
                );
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn unrepost_removes_edge_and_repost_record() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        register(&fx, "u2", "bob").await;

        let target = fx.service.create("u2", note("original")).await.unwrap();
        let repost = fx.service.repost("u1", &target.id).await.unwrap();

        let count = fx.service.unrepost("u1", &target.id).await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(fx.service.get_post(&target.id).await.unwrap().repost_count, 0);
        assert!(fx.service.get_post(&repost.id).await.unwrap().is_deleted);

        // A fresh repost is allowed again.
        fx.service.repost("u1", &target.id).await.unwrap();
    }

    #[tokio::test]
    async fn delete_marks_record_and_fans_out() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;

        let post = fx.service.create("u1", note("bye")).await.unwrap();
        fx.service.like("u1", &post.id).await.unwrap();

        // Drain the create fan-out first.
        let created = fx.queue.receive(10).await.unwrap();
        for delivery in &created {
            fx.queue.ack(delivery).await.unwrap();
        }

        fx.service.delete("u1", &post.id).await.unwrap();

        let record = fx.service.get_post(&post.id).await.unwrap();
        assert!(record.is_deleted);
        assert!(record.deleted_at.is_some());
        assert_eq!(record.like_count, 0);
        assert_eq!(fx.users.profile("u1").await.unwrap().post_count, 0);

        let batch = fx.queue.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0].message, FanoutMessage::DeletePost { .. }));

        assert!(fx.feeds.entries("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_requires_authorship() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        register(&fx, "u2", "bob").await;

        let post = fx.service.create("u1", note("mine")).await.unwrap();
        let err = fx.service.delete("u2", &post.id).await.unwrap_err();
        assert!(matches!(err, WireError::Forbidden(_)));
    }

    #[tokio::test]
    async fn concurrent_likes_reconcile_exactly() {
        let fx = fixture();
        register(&fx, "author", "alice").await;
        let post = fx.service.create("author", note("popular")).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..5 {
            let service = fx.service.clone();
            let users = fx.users.clone();
            let post_id = post.id.clone();
            tasks.push(tokio::spawn(async move {
                let liker = format!("liker{}", i);
                users
                    .initialize(user_state(&liker, &format!("liker{}", i)))
                    .await
                    .unwrap();
                service.like(&liker, &post_id).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let record = fx.service.get_post(&post.id).await.unwrap();
        assert_eq!(record.like_count, 5);
        let state = fx.post_actors.get(&post.id).await.unwrap();
        assert_eq!(state.liked_by.len(), 5);
    }

    #[tokio::test]
    async fn like_unlike_idempotent_on_record() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        let post = fx.service.create("u1", note("hey")).await.unwrap();

        assert_eq!(fx.service.like("u1", &post.id).await.unwrap(), 1);
        assert_eq!(fx.service.like("u1", &post.id).await.unwrap(), 1);
        assert_eq!(fx.service.get_post(&post.id).await.unwrap().like_count, 1);

        assert_eq!(fx.service.unlike("u1", &post.id).await.unwrap(), 0);
        assert_eq!(fx.service.unlike("u1", &post.id).await.unwrap(), 0);
        assert_eq!(fx.service.get_post(&post.id).await.unwrap().like_count, 0);
    }

    #[test]
    fn mention_extraction() {
        assert_eq!(
            extract_mentions("hey @alice and @bob_1, not email@example.com"),
            vec!["alice".to_string(), "bob_1".to_string()]
        );
        assert_eq!(extract_mentions("@alice @alice"), vec!["alice".to_string()]);
        assert!(extract_mentions("no mentions here").is_empty());
        assert!(extract_mentions("@ab").is_empty());
    }

    #[tokio::test]
    async fn quote_increments_quote_count() {
        let fx = fixture();
        register(&fx, "u1", "alice").await;
        register(&fx, "u2", "bob").await;

        let target = fx.service.create("u2", note("quote me")).await.unwrap();
        let quote = fx
            .service
            .create(
                "u1",
                CreatePostRequest {
                    content: "look at this".to_string(),
                    quote_of_id: Some(target.id.clone()),
                    ..CreatePostRequest::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(quote.kind, PostKind::Quote { .. }));
        assert_eq!(fx.service.get_post(&target.id).await.unwrap().quote_count, 1);
    }

}
