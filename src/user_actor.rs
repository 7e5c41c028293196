use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actor::ActorHost;
use crate::errors::{WireError, WireResult};
use crate::kv::KvStore;
use crate::model::{
    normalize_muted_words, profile_key, MutedWord, Profile, ProfileView, Settings,
    MAX_LIKED_POSTS,
};

pub const USER_NAMESPACE: &str = "user";

/// Authoritative per-user state: account, profile, settings and the social
/// graph. Social sets are ordered sets, giving O(log n) membership and
/// deterministic serialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub id: String,
    pub handle: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    pub profile: Profile,
    pub settings: Settings,
    pub following: BTreeSet<String>,
    pub followers: BTreeSet<String>,
    pub blocked: BTreeSet<String>,
    pub liked_posts: Vec<String>,
}

impl UserState {
    pub fn profile_view(&self) -> ProfileView {
        ProfileView {
            id: self.id.clone(),
            handle: self.handle.clone(),
            profile: self.profile.clone(),
        }
    }
}

/// Mutable profile fields. Handle, id, joinedAt, counters and the
/// moderation flags are immutable from this endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
    pub avatar_url: Option<String>,
    pub banner_url: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub email_notifications: Option<bool>,
    pub private_account: Option<bool>,
    pub muted_words: Option<Vec<MutedWord>>,
}

/// Batched read for feed assembly, one actor call instead of three.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub blocked: BTreeSet<String>,
    pub muted_words: Vec<MutedWord>,
    pub following: BTreeSet<String>,
}

const MAX_BIO_LENGTH: usize = 160;

#[derive(Clone)]
pub struct UserActors {
    host: Arc<ActorHost<UserState>>,
    kv: Arc<dyn KvStore>,
}

impl UserActors {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            host: ActorHost::new(kv.clone(), USER_NAMESPACE),
            kv,
        }
    }

    pub async fn initialize(&self, state: UserState) -> WireResult<()> {
        let id = state.id.clone();
        self.host.init(&id, state).await
    }

    pub async fn exists(&self, user_id: &str) -> WireResult<bool> {
        self.host.exists(user_id).await
    }

    pub async fn get(&self, user_id: &str) -> WireResult<UserState> {
        self.host.read(user_id, |state| state.clone()).await
    }

    pub async fn profile(&self, user_id: &str) -> WireResult<Profile> {
        self.host.read(user_id, |state| state.profile.clone()).await
    }

    pub async fn profile_view(&self, user_id: &str) -> WireResult<ProfileView> {
        self.host.read(user_id, |state| state.profile_view()).await
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        patch: ProfilePatch,
    ) -> WireResult<ProfileView> {
        if let Some(bio) = &patch.bio {
            if bio.chars().count() > MAX_BIO_LENGTH {
                return Err(WireError::validation(format!(
                    "bio must be at most {} characters",
                    MAX_BIO_LENGTH
                )));
            }
        }

        let view = self
            .host
            .update(user_id, move |state| {
                let profile = &mut state.profile;
                if let Some(display_name) = patch.display_name {
                    profile.display_name = display_name;
                }
                if let Some(bio) = patch.bio {
                    profile.bio = bio;
                }
                if let Some(location) = patch.location {
                    profile.location = location;
                }
                if let Some(website) = patch.website {
                    profile.website = website;
                }
                if let Some(avatar_url) = patch.avatar_url {
                    profile.avatar_url = avatar_url;
                }
                if let Some(banner_url) = patch.banner_url {
                    profile.banner_url = banner_url;
                }
                Ok(state.profile_view())
            })
            .await?;

        self.invalidate_profile(&view.handle).await;
        Ok(view)
    }

    pub async fn settings(&self, user_id: &str) -> WireResult<Settings> {
        let now = Utc::now();
        self.host
            .read(user_id, move |state| {
                let mut settings = state.settings.clone();
                settings.muted_words = normalize_muted_words(&settings.muted_words, now);
                settings
            })
            .await
    }

    pub async fn update_settings(
        &self,
        user_id: &str,
        patch: SettingsPatch,
    ) -> WireResult<Settings> {
        let now = Utc::now();
        self.host
            .update(user_id, move |state| {
                if let Some(email_notifications) = patch.email_notifications {
                    state.settings.email_notifications = email_notifications;
                }
                if let Some(private_account) = patch.private_account {
                    state.settings.private_account = private_account;
                }
                if let Some(muted_words) = patch.muted_words {
                    state.settings.muted_words = normalize_muted_words(&muted_words, now);
                } else {
                    state.settings.muted_words =
                        normalize_muted_words(&state.settings.muted_words, now);
                }
                Ok(state.settings.clone())
            })
            .await
    }

    pub async fn context(&self, user_id: &str) -> WireResult<UserContext> {
        let now = Utc::now();
        self.host
            .read(user_id, move |state| UserContext {
                blocked: state.blocked.clone(),
                muted_words: normalize_muted_words(&state.settings.muted_words, now),
                following: state.following.clone(),
            })
            .await
    }

    /// Idempotent; no-op when following yourself.
    pub async fn follow(&self, user_id: &str, target_id: &str) -> WireResult<bool> {
        if user_id == target_id {
            return Ok(false);
        }
        let target_id = target_id.to_string();
        self.host
            .update(user_id, move |state| {
                let added = state.following.insert(target_id);
                state.profile.following_count = state.following.len() as u64;
                Ok(added)
            })
            .await
    }

    pub async fn unfollow(&self, user_id: &str, target_id: &str) -> WireResult<bool> {
        if user_id == target_id {
            return Ok(false);
        }
        let target_id = target_id.to_string();
        self.host
            .update(user_id, move |state| {
                let removed = state.following.remove(&target_id);
                state.profile.following_count = state.following.len() as u64;
                Ok(removed)
            })
            .await
    }

    pub async fn add_follower(&self, user_id: &str, follower_id: &str) -> WireResult<bool> {
        if user_id == follower_id {
            return Ok(false);
        }
        let follower_id = follower_id.to_string();
        self.host
            .update(user_id, move |state| {
                let added = state.followers.insert(follower_id);
                state.profile.follower_count = state.followers.len() as u64;
                Ok(added)
            })
            .await
    }

    pub async fn remove_follower(&self, user_id: &str, follower_id: &str) -> WireResult<bool> {
        if user_id == follower_id {
            return Ok(false);
        }
        let follower_id = follower_id.to_string();
        self.host
            .update(user_id, move |state| {
                let removed = state.followers.remove(&follower_id);
                state.profile.follower_count = state.followers.len() as u64;
                Ok(removed)
            })
            .await
    }

    /// Blocking severs both edges held by this actor; the caller is
    /// responsible for the symmetric edges on the target's actor.
    pub async fn block(&self, user_id: &str, target_id: &str) -> WireResult<bool> {
        if user_id == target_id {
            return Ok(false);
        }
        let target_id = target_id.to_string();
        self.host
            .update(user_id, move |state| {
                let added = state.blocked.insert(target_id.clone());
                state.following.remove(&target_id);
                state.followers.remove(&target_id);
                state.profile.following_count = state.following.len() as u64;
                state.profile.follower_count = state.followers.len() as u64;
                Ok(added)
            })
            .await
    }

    pub async fn unblock(&self, user_id: &str, target_id: &str) -> WireResult<bool> {
        let target_id = target_id.to_string();
        self.host
            .update(user_id, move |state| Ok(state.blocked.remove(&target_id)))
            .await
    }

    pub async fn is_following(&self, user_id: &str, target_id: &str) -> WireResult<bool> {
        self.host
            .read(user_id, |state| state.following.contains(target_id))
            .await
    }

    pub async fn is_blocked(&self, user_id: &str, target_id: &str) -> WireResult<bool> {
        self.host
            .read(user_id, |state| state.blocked.contains(target_id))
            .await
    }

    pub async fn followers(&self, user_id: &str) -> WireResult<BTreeSet<String>> {
        self.host
            .read(user_id, |state| state.followers.clone())
            .await
    }

    pub async fn following(&self, user_id: &str) -> WireResult<BTreeSet<String>> {
        self.host
            .read(user_id, |state| state.following.clone())
            .await
    }

    pub async fn blocked(&self, user_id: &str) -> WireResult<BTreeSet<String>> {
        self.host.read(user_id, |state| state.blocked.clone()).await
    }

    /// Most-recent-first, deduplicated, capped.
    pub async fn liked_posts_add(&self, user_id: &str, post_id: &str) -> WireResult<()> {
        let post_id = post_id.to_string();
        self.host
            .update(user_id, move |state| {
                state.liked_posts.retain(|id| id != &post_id);
                state.liked_posts.insert(0, post_id);
                state.liked_posts.truncate(MAX_LIKED_POSTS);
                Ok(())
            })
            .await
    }

    pub async fn liked_posts_remove(&self, user_id: &str, post_id: &str) -> WireResult<()> {
        let post_id = post_id.to_string();
        self.host
            .update(user_id, move |state| {
                state.liked_posts.retain(|id| id != &post_id);
                Ok(())
            })
            .await
    }

    pub async fn posts_increment(&self, user_id: &str) -> WireResult<u64> {
        self.host
            .update(user_id, |state| {
                state.profile.post_count += 1;
                Ok(state.profile.post_count)
            })
            .await
    }

    pub async fn posts_decrement(&self, user_id: &str) -> WireResult<u64> {
        self.host
            .update(user_id, |state| {
                state.profile.post_count = state.profile.post_count.saturating_sub(1);
                Ok(state.profile.post_count)
            })
            .await
    }

    pub async fn posts_reset(&self, user_id: &str) -> WireResult<()> {
        self.host
            .update(user_id, |state| {
                state.profile.post_count = 0;
                Ok(())
            })
            .await
    }

    /// Self-healing: rewrite both counters from set cardinalities.
    pub async fn sync_counts(&self, user_id: &str) -> WireResult<()> {
        self.host
            .update(user_id, |state| {
                state.profile.following_count = state.following.len() as u64;
                state.profile.follower_count = state.followers.len() as u64;
                Ok(())
            })
            .await
    }

    pub async fn ban(&self, user_id: &str, reason: &str) -> WireResult<()> {
        let reason = reason.to_string();
        let handle = self
            .host
            .update(user_id, move |state| {
                state.profile.is_banned = true;
                state.profile.banned_at = Some(Utc::now());
                state.profile.banned_reason = Some(reason);
                Ok(state.handle.clone())
            })
            .await?;
        self.invalidate_profile(&handle).await;
        Ok(())
    }

    pub async fn unban(&self, user_id: &str) -> WireResult<()> {
        let handle = self
            .host
            .update(user_id, |state| {
                state.profile.is_banned = false;
                state.profile.banned_at = None;
                state.profile.banned_reason = None;
                Ok(state.handle.clone())
            })
            .await?;
        self.invalidate_profile(&handle).await;
        Ok(())
    }

    pub async fn is_banned(&self, user_id: &str) -> WireResult<bool> {
        self.host
            .read(user_id, |state| state.profile.is_banned)
            .await
    }

    pub async fn set_admin(&self, user_id: &str, is_admin: bool) -> WireResult<()> {
        let handle = self
            .host
            .update(user_id, move |state| {
                state.profile.is_admin = is_admin;
                Ok(state.handle.clone())
            })
            .await?;
        self.invalidate_profile(&handle).await;
        Ok(())
    }

    pub async fn is_admin(&self, user_id: &str) -> WireResult<bool> {
        self.host
            .read(user_id, |state| state.profile.is_admin)
            .await
    }

    pub async fn set_password(&self, user_id: &str, hash: &str, salt: &str) -> WireResult<()> {
        let hash = hash.to_string();
        let salt = salt.to_string();
        self.host
            .update(user_id, move |state| {
                state.password_hash = hash;
                state.salt = salt;
                Ok(())
            })
            .await
    }

    pub async fn touch_login(&self, user_id: &str) -> WireResult<()> {
        self.host
            .update(user_id, |state| {
                state.last_login = Some(Utc::now());
                Ok(())
            })
            .await
    }

    // The cached profile-by-handle view must not outlive a change to what it
    // shows; failures only delay convergence until the TTL.
    async fn invalidate_profile(&self, handle: &str) {
        if let Err(err) = self.kv.delete(&profile_key(handle)).await {
            tracing::warn!(handle = %handle, error = ?err, "profile cache invalidation failed");
        }
    }
}
