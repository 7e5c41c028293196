use std::sync::Arc;

use async_trait::async_trait;

use crate::model::Post;

/// Search indexing collaborator. The engagement plane only tells it what
/// changed; indexing and querying live elsewhere.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_post(&self, post: &Post);

    async fn remove_post(&self, post_id: &str);
}

/// Notification delivery collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn reply(&self, recipient_id: &str, reply: &Post);

    async fn repost(&self, recipient_id: &str, repost: &Post);

    async fn mention(&self, recipient_id: &str, post: &Post);

    async fn password_reset(&self, email: &str, token: &str);
}

/// Default collaborator: logs and drops.
#[derive(Default)]
pub struct LogCollaborators;

impl LogCollaborators {
    pub fn search() -> Arc<dyn SearchIndex> {
        Arc::new(Self)
    }

    pub fn notifier() -> Arc<dyn Notifier> {
        Arc::new(Self)
    }
}

#[async_trait]
impl SearchIndex for LogCollaborators {
    async fn index_post(&self, post: &Post) {
        tracing::debug!(post_id = %post.id, "index post");
    }

    async fn remove_post(&self, post_id: &str) {
        tracing::debug!(post_id = %post_id, "remove post from index");
    }
}

#[async_trait]
impl Notifier for LogCollaborators {
    async fn reply(&self, recipient_id: &str, reply: &Post) {
        tracing::debug!(recipient_id = %recipient_id, post_id = %reply.id, "notify reply");
    }

    async fn repost(&self, recipient_id: &str, repost: &Post) {
        tracing::debug!(recipient_id = %recipient_id, post_id = %repost.id, "notify repost");
    }

    async fn mention(&self, recipient_id: &str, post: &Post) {
        tracing::debug!(recipient_id = %recipient_id, post_id = %post.id, "notify mention");
    }

    async fn password_reset(&self, email: &str, _token: &str) {
        tracing::debug!(email = %email, "password reset requested");
    }
}
