use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;

pub const MAX_MUTED_WORDS: usize = 100;
pub const MAX_LIKED_POSTS: usize = 1000;
pub const MAX_FEED_ENTRIES: usize = 1000;
pub const MAX_USER_POSTS_INDEX: usize = 1000;

pub const FOF_RANKED_KEY: &str = "fof:ranked";
pub const EXPLORE_RANKED_KEY: &str = "explore:ranked";

pub fn post_key(id: &str) -> String {
    format!("post:{}", id)
}

pub fn user_posts_key(user_id: &str) -> String {
    format!("user-posts:{}", user_id)
}

pub fn replies_key(post_id: &str) -> String {
    format!("replies:{}", post_id)
}

pub fn handle_key(handle: &str) -> String {
    format!("handle:{}", handle)
}

pub fn email_key(email: &str) -> String {
    format!("email:{}", email)
}

pub fn profile_key(handle: &str) -> String {
    format!("profile:{}", handle)
}

pub fn reset_token_key(token: &str) -> String {
    format!("reset-token:{}", token)
}

pub fn reset_user_key(user_id: &str) -> String {
    format!("reset:{}", user_id)
}

/// Mutable display fields plus the counters and moderation flags the service
/// maintains. Embedded in the user actor state and served through the cached
/// `profile:{handle}` view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: String,
    pub bio: String,
    pub location: String,
    pub website: String,
    pub avatar_url: String,
    pub banner_url: String,
    pub joined_at: DateTime<Utc>,
    pub follower_count: u64,
    pub following_count: u64,
    pub post_count: u64,
    pub is_verified: bool,
    pub is_banned: bool,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_reason: Option<String>,
}

impl Profile {
    pub fn new(display_name: &str, joined_at: DateTime<Utc>) -> Self {
        Self {
            display_name: display_name.to_string(),
            bio: String::new(),
            location: String::new(),
            website: String::new(),
            avatar_url: String::new(),
            banner_url: String::new(),
            joined_at,
            follower_count: 0,
            following_count: 0,
            post_count: 0,
            is_verified: false,
            is_banned: false,
            is_admin: false,
            banned_at: None,
            banned_reason: None,
        }
    }
}

/// Public user view, cached at `profile:{handle}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub id: String,
    pub handle: String,
    #[serde(flatten)]
    pub profile: Profile,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutedWordScope {
    All,
    NotFollowing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutedWord {
    pub word: String,
    pub scope: MutedWordScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub email_notifications: bool,
    pub private_account: bool,
    pub muted_words: Vec<MutedWord>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            email_notifications: true,
            private_account: false,
            muted_words: Vec::new(),
        }
    }
}

/// Canonical muted-word form: trimmed, lowercased, deduplicated by
/// `(word, scope)`, expired entries dropped, capped. Applied on both read
/// and write so stored settings converge.
pub fn normalize_muted_words(words: &[MutedWord], now: DateTime<Utc>) -> Vec<MutedWord> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in words {
        let word = entry.word.trim().to_lowercase();
        if word.is_empty() {
            continue;
        }
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= now {
                continue;
            }
        }
        if seen.insert((word.clone(), entry.scope)) {
            out.push(MutedWord {
                word,
                scope: entry.scope,
                expires_at: entry.expires_at,
            });
        }
        if out.len() == MAX_MUTED_WORDS {
            break;
        }
    }
    out
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Case-insensitive muted-word match with word boundaries: `"spam"` matches
/// `"this is SPAM content"` but not `"spammer"`. `word` must already be
/// lowercased (normalized form).
pub fn matches_muted_word(content: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let haystack = content.to_lowercase();
    let mut start = 0;
    while let Some(found) = haystack[start..].find(word) {
        let at = start + found;
        let end = at + word.len();
        let before_ok = haystack[..at]
            .chars()
            .next_back()
            .map(|c| !is_word_char(c))
            .unwrap_or(true);
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map(|c| !is_word_char(c))
            .unwrap_or(true);
        if before_ok && after_ok {
            return true;
        }
        match haystack[at..].chars().next() {
            Some(c) => start = at + c.len_utf8(),
            None => break,
        }
    }
    false
}

pub fn matches_any_muted_word(content: &str, words: &[String]) -> bool {
    words.iter().any(|word| matches_muted_word(content, word))
}

/// What a post is, beyond its shared metadata header. Serialized to the
/// optional-field wire shape (`replyToId`/`quoteOfId`/`repostOfId`) the
/// client expects; at most one of the three is ever set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "PostKindWire", into = "PostKindWire")]
pub enum PostKind {
    #[default]
    Original,
    Reply {
        parent_id: String,
    },
    Quote {
        quoted_id: String,
    },
    Repost {
        original_id: String,
        snapshot: Option<Box<Post>>,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostKindWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quote_of_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repost_of_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_post: Option<Box<Post>>,
}

impl From<PostKindWire> for PostKind {
    fn from(wire: PostKindWire) -> Self {
        if let Some(parent_id) = wire.reply_to_id {
            PostKind::Reply { parent_id }
        } else if let Some(quoted_id) = wire.quote_of_id {
            PostKind::Quote { quoted_id }
        } else if let Some(original_id) = wire.repost_of_id {
            PostKind::Repost {
                original_id,
                snapshot: wire.original_post,
            }
        } else {
            PostKind::Original
        }
    }
}

impl From<PostKind> for PostKindWire {
    fn from(kind: PostKind) -> Self {
        match kind {
            PostKind::Original => PostKindWire::default(),
            PostKind::Reply { parent_id } => PostKindWire {
                reply_to_id: Some(parent_id),
                ..PostKindWire::default()
            },
            PostKind::Quote { quoted_id } => PostKindWire {
                quote_of_id: Some(quoted_id),
                ..PostKindWire::default()
            },
            PostKind::Repost {
                original_id,
                snapshot,
            } => PostKindWire {
                repost_of_id: Some(original_id),
                original_post: snapshot,
                ..PostKindWire::default()
            },
        }
    }
}

/// The cached post record at `post:{id}`. Counter fields mirror the
/// authoritative actor sets and are always overwritten with actor-returned
/// values, never incremented in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub author_handle: String,
    pub author_display_name: String,
    pub author_avatar_url: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(flatten)]
    pub kind: PostKind,
    pub created_at: DateTime<Utc>,
    pub like_count: u64,
    pub reply_count: u64,
    pub repost_count: u64,
    pub quote_count: u64,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_taken_down: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_down_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_down_reason: Option<String>,
}

impl Post {
    pub fn is_repost(&self) -> bool {
        matches!(self.kind, PostKind::Repost { .. })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, PostKind::Reply { .. })
    }

    pub fn parent_id(&self) -> Option<&str> {
        match &self.kind {
            PostKind::Reply { parent_id } => Some(parent_id),
            _ => None,
        }
    }

    pub fn repost_of_id(&self) -> Option<&str> {
        match &self.kind {
            PostKind::Repost { original_id, .. } => Some(original_id),
            _ => None,
        }
    }

    pub fn is_visible(&self) -> bool {
        !self.is_deleted && !self.is_taken_down
    }

    pub fn engagement(&self) -> u64 {
        self.like_count + self.reply_count + self.repost_count + self.quote_count
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 3600.0
    }

    /// Engagement-over-age score. Quote counts are a reader-side concern and
    /// are not part of the discovery ranker's numerator.
    pub fn hn_score(&self, scoring: &ScoringConfig, now: DateTime<Utc>) -> f64 {
        let engagement = self.like_count as f64 * scoring.like_weight
            + self.reply_count as f64 * scoring.reply_weight
            + self.repost_count as f64 * scoring.repost_weight;
        engagement / (self.age_hours(now) + scoring.base_offset).powf(scoring.exp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    Own,
    Follow,
    Fof,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub post_id: String,
    pub author_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: FeedSource,
}

/// Compact ranked reference, the `fof:ranked` blob format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedRef {
    pub post_id: String,
    pub score: f64,
    pub author_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub posts: Vec<Post>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scoring() -> ScoringConfig {
        ScoringConfig {
            exp: 1.3,
            base_offset: 4.0,
            like_weight: 1.0,
            reply_weight: 10.0,
            repost_weight: 3.0,
        }
    }

    pub(crate) fn post(id: &str, author: &str, created_at: DateTime<Utc>) -> Post {
        Post {
            id: id.to_string(),
            author_id: author.to_string(),
            author_handle: author.to_string(),
            author_display_name: author.to_string(),
            author_avatar_url: String::new(),
            content: format!("post {}", id),
            media_urls: Vec::new(),
            kind: PostKind::Original,
            created_at,
            like_count: 0,
            reply_count: 0,
            repost_count: 0,
            quote_count: 0,
            is_deleted: false,
            deleted_at: None,
            is_taken_down: false,
            taken_down_at: None,
            taken_down_reason: None,
        }
    }

    #[test]
    fn post_kind_round_trips_through_wire_fields() {
        let now = Utc::now();
        let mut reply = post("p2", "alice", now);
        reply.kind = PostKind::Reply {
            parent_id: "p1".to_string(),
        };

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["replyToId"], "p1");
        assert!(json.get("quoteOfId").is_none());
        assert!(json.get("repostOfId").is_none());

        let back: Post = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, reply.kind);
    }

    #[test]
    fn repost_carries_snapshot() {
        let now = Utc::now();
        let original = post("p1", "bob", now);
        let mut repost = post("p3", "alice", now);
        repost.content = String::new();
        repost.kind = PostKind::Repost {
            original_id: "p1".to_string(),
            snapshot: Some(Box::new(original.clone())),
        };

        let json = serde_json::to_value(&repost).unwrap();
        assert_eq!(json["repostOfId"], "p1");
        assert_eq!(json["originalPost"]["id"], "p1");

        let back: Post = serde_json::from_value(json).unwrap();
        assert_eq!(back.repost_of_id(), Some("p1"));
        assert!(back.is_repost());
    }

    #[test]
    fn bare_record_is_original() {
        let json = serde_json::to_value(post("p1", "alice", Utc::now())).unwrap();
        assert!(json.get("replyToId").is_none());
        let back: Post = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, PostKind::Original);
    }

    #[test]
    fn muted_word_normalization() {
        let now = Utc::now();
        let words = vec![
            MutedWord {
                word: "  Spam ".to_string(),
                scope: MutedWordScope::All,
                expires_at: None,
            },
            MutedWord {
                word: "spam".to_string(),
                scope: MutedWordScope::All,
                expires_at: None,
            },
            MutedWord {
                word: "spam".to_string(),
                scope: MutedWordScope::NotFollowing,
                expires_at: None,
            },
            MutedWord {
                word: "stale".to_string(),
                scope: MutedWordScope::All,
                expires_at: Some(now - Duration::minutes(1)),
            },
            MutedWord {
                word: "   ".to_string(),
                scope: MutedWordScope::All,
                expires_at: None,
            },
        ];

        let normalized = normalize_muted_words(&words, now);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].word, "spam");
        assert_eq!(normalized[0].scope, MutedWordScope::All);
        assert_eq!(normalized[1].scope, MutedWordScope::NotFollowing);
    }

    #[test]
    fn muted_word_cap() {
        let words: Vec<MutedWord> = (0..150)
            .map(|i| MutedWord {
                word: format!("word{}", i),
                scope: MutedWordScope::All,
                expires_at: None,
            })
            .collect();
        assert_eq!(normalize_muted_words(&words, Utc::now()).len(), 100);
    }

    #[test]
    fn muted_word_boundaries() {
        assert!(matches_muted_word("this is SPAM content", "spam"));
        assert!(matches_muted_word("spam", "spam"));
        assert!(matches_muted_word("no spam!", "spam"));
        assert!(!matches_muted_word("spammer alert", "spam"));
        assert!(!matches_muted_word("despamify", "spam"));
        assert!(matches_muted_word("hot take: crypto again", "crypto"));
        assert!(matches_muted_word("multi word phrase here", "word phrase"));
    }

    #[test]
    fn hn_score_newer_wins_on_equal_counts() {
        let now = Utc::now();
        let mut older = post("p1", "a", now - Duration::hours(10));
        let mut newer = post("p2", "b", now - Duration::hours(1));
        older.like_count = 5;
        newer.like_count = 5;
        assert!(newer.hn_score(&scoring(), now) > older.hn_score(&scoring(), now));
    }

    #[test]
    fn hn_score_more_engagement_wins_on_equal_age() {
        let now = Utc::now();
        let created = now - Duration::hours(2);
        let mut quiet = post("p1", "a", created);
        let mut busy = post("p2", "b", created);
        quiet.like_count = 1;
        busy.like_count = 1;
        busy.reply_count = 2;
        assert!(busy.hn_score(&scoring(), now) > quiet.hn_score(&scoring(), now));
    }
}
