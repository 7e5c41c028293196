use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use serde::Deserialize;

#[derive(Clone)]
pub struct HttpPort(u16);

#[derive(Clone)]
pub struct AllowedOrigins(Vec<String>);

#[derive(Clone)]
pub struct TaskEnable(bool);

#[derive(Clone)]
pub struct TaskInterval(Duration);

/// Ranking constants for the engagement-over-age score.
#[derive(Clone, Debug)]
pub struct ScoringConfig {
    pub exp: f64,
    pub base_offset: f64,
    pub like_weight: f64,
    pub reply_weight: f64,
    pub repost_weight: f64,
}

#[derive(Clone, Debug)]
pub struct RetentionConfig {
    pub feed_entries: Duration,
    pub deleted_posts: Duration,
}

#[derive(Clone, Debug)]
pub struct CacheTtlConfig {
    pub fof_rankings: Duration,
    pub profile: Duration,
}

/// Operator-provided list of accounts every new signup auto-follows.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SeedUsers {
    #[serde(default)]
    pub seed_users: Vec<SeedUser>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SeedUser {
    pub handle: String,
}

impl SeedUsers {
    pub fn is_empty(&self) -> bool {
        self.seed_users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.seed_users.len()
    }
}

#[derive(Clone)]
pub struct Config {
    pub version: String,
    pub http_port: HttpPort,
    pub database_url: String,
    pub token_secret: String,
    pub token_ttl: Duration,
    pub allowed_origins: AllowedOrigins,
    pub initial_admin_handle: Option<String>,

    pub max_note_length: usize,
    pub max_feed_entries: usize,
    pub max_thread_depth: usize,
    pub max_pagination_limit: usize,
    pub default_feed_page_size: usize,

    pub scoring: ScoringConfig,
    pub retention: RetentionConfig,
    pub cache_ttl: CacheTtlConfig,

    pub ranker_enable: TaskEnable,
    pub ranker_interval: TaskInterval,
    pub feed_gc_enable: TaskEnable,
    pub feed_gc_interval: TaskInterval,
    pub compaction_enable: TaskEnable,
    pub compaction_interval: TaskInterval,

    pub fanout_enable: TaskEnable,
    pub fanout_batch_size: usize,
    pub fanout_concurrency: usize,
    pub fanout_poll_interval: TaskInterval,

    pub seed_users: Option<SeedUsers>,
}

impl Config {
    pub fn new() -> Result<Self> {
        let http_port: HttpPort = default_env("HTTP_PORT", "4060").try_into()?;
        let database_url = default_env("DATABASE_URL", "sqlite://development.db");
        let token_secret = require_env("TOKEN_SECRET")?;

        let token_ttl_hours = parse_usize("TOKEN_TTL_HOURS", "24")?;
        let token_ttl = Duration::hours(token_ttl_hours as i64);

        let allowed_origins: AllowedOrigins = optional_env("ALLOWED_ORIGINS").try_into()?;

        let initial_admin_handle = {
            let value = optional_env("INITIAL_ADMIN_HANDLE");
            if value.is_empty() {
                None
            } else {
                Some(value.to_lowercase())
            }
        };

        let max_note_length = parse_usize("MAX_NOTE_LENGTH", "280")?;
        let max_feed_entries = parse_usize("MAX_FEED_ENTRIES", "1000")?;
        let max_thread_depth = parse_usize("MAX_THREAD_DEPTH", "10")?;
        let max_pagination_limit = parse_usize("MAX_PAGINATION_LIMIT", "50")?;
        let default_feed_page_size = parse_usize("DEFAULT_FEED_PAGE_SIZE", "20")?;

        let scoring = ScoringConfig {
            exp: parse_f64("SCORING_EXP", "1.3")?,
            base_offset: parse_f64("SCORING_BASE_OFFSET", "4")?,
            like_weight: parse_f64("SCORING_LIKE_W", "1")?,
            reply_weight: parse_f64("SCORING_REPLY_W", "10")?,
            repost_weight: parse_f64("SCORING_REPOST_W", "3")?,
        };

        let retention = RetentionConfig {
            feed_entries: parse_interval("RETENTION_FEED_ENTRIES", "7d")?,
            deleted_posts: parse_interval("RETENTION_DELETED_POSTS", "30d")?,
        };

        let cache_ttl = CacheTtlConfig {
            fof_rankings: parse_interval("CACHE_TTL_FOF_RANKINGS", "15m")?,
            profile: parse_interval("CACHE_TTL_PROFILE", "1h")?,
        };

        let ranker_enable: TaskEnable = default_env("RANKER_ENABLE", "true").try_into()?;
        let ranker_interval: TaskInterval = default_env("RANKER_INTERVAL", "15m").try_into()?;

        let feed_gc_enable: TaskEnable = default_env("FEED_GC_ENABLE", "true").try_into()?;
        let feed_gc_interval: TaskInterval = default_env("FEED_GC_INTERVAL", "1h").try_into()?;

        let compaction_enable: TaskEnable = default_env("COMPACTION_ENABLE", "true").try_into()?;
        let compaction_interval: TaskInterval =
            default_env("COMPACTION_INTERVAL", "24h").try_into()?;

        let fanout_enable: TaskEnable = default_env("FANOUT_ENABLE", "true").try_into()?;
        let fanout_batch_size = parse_usize("FANOUT_BATCH_SIZE", "16")?;
        let fanout_concurrency = parse_usize("FANOUT_CONCURRENCY", "16")?;
        let fanout_poll_interval: TaskInterval =
            default_env("FANOUT_POLL_INTERVAL", "1s").try_into()?;

        let seed_users_path = optional_env("SEED_USERS");
        let seed_users = if seed_users_path.is_empty() {
            None
        } else {
            Some(load_seed_users(&seed_users_path)?)
        };

        Ok(Self {
            version: version()?,
            http_port,
            database_url,
            token_secret,
            token_ttl,
            allowed_origins,
            initial_admin_handle,
            max_note_length,
            max_feed_entries,
            max_thread_depth,
            max_pagination_limit,
            default_feed_page_size,
            scoring,
            retention,
            cache_ttl,
            ranker_enable,
            ranker_interval,
            feed_gc_enable,
            feed_gc_interval,
            compaction_enable,
            compaction_interval,
            fanout_enable,
            fanout_batch_size,
            fanout_concurrency,
            fanout_poll_interval,
            seed_users,
        })
    }
}

fn load_seed_users(path: &str) -> Result<SeedUsers> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read seed users file {}", path))?;
    let mut seeds: SeedUsers =
        serde_yaml::from_str(&content).context("cannot parse seed users file")?;
    for seed in seeds.seed_users.iter_mut() {
        seed.handle = seed.handle.trim().to_lowercase();
    }
    Ok(seeds)
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|err| anyhow::Error::new(err).context(anyhow!("{} must be set", name)))
}

fn optional_env(name: &str) -> String {
    std::env::var(name).unwrap_or("".to_string())
}

fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or(default_value.to_string())
}

fn parse_usize(name: &str, default_value: &str) -> Result<usize> {
    default_env(name, default_value)
        .parse::<usize>()
        .map_err(|err| anyhow::Error::new(err).context(anyhow!("parsing {} failed", name)))
}

fn parse_f64(name: &str, default_value: &str) -> Result<f64> {
    default_env(name, default_value)
        .parse::<f64>()
        .map_err(|err| anyhow::Error::new(err).context(anyhow!("parsing {} failed", name)))
}

fn parse_interval(name: &str, default_value: &str) -> Result<Duration> {
    let value = default_env(name, default_value);
    duration_str::parse_chrono(&value)
        .map_err(|err| anyhow!(err).context(anyhow!("parsing {} into duration failed", name)))
}

pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(anyhow!("one of GIT_HASH or CARGO_PKG_VERSION must be set"))
}

impl TryFrom<String> for HttpPort {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Ok(Self(80))
        } else {
            value.parse::<u16>().map(Self).map_err(|err| {
                anyhow::Error::new(err).context(anyhow!("parsing HTTP_PORT into u16 failed"))
            })
        }
    }
}

impl AsRef<u16> for HttpPort {
    fn as_ref(&self) -> &u16 {
        &self.0
    }
}

impl TryFrom<String> for AllowedOrigins {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(
            value
                .split(',')
                .filter_map(|s| {
                    let s = s.trim();
                    if s.is_empty() {
                        None
                    } else {
                        Some(s.to_string())
                    }
                })
                .collect::<Vec<String>>(),
        ))
    }
}

impl AsRef<Vec<String>> for AllowedOrigins {
    fn as_ref(&self) -> &Vec<String> {
        &self.0
    }
}

impl AsRef<bool> for TaskEnable {
    fn as_ref(&self) -> &bool {
        &self.0
    }
}

impl TryFrom<String> for TaskEnable {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.parse::<bool>().map_err(|err| {
            anyhow::Error::new(err).context(anyhow!("parsing task enable into bool failed"))
        })?;
        Ok(Self(value))
    }
}

impl AsRef<Duration> for TaskInterval {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for TaskInterval {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        let duration = duration_str::parse_chrono(&value)
            .map_err(|err| anyhow!(err).context("parsing task interval into duration failed"))?;
        Ok(Self(duration))
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests() -> Self {
        Self {
            version: "test".to_string(),
            http_port: "0".to_string().try_into().expect("valid port"),
            database_url: "sqlite::memory:".to_string(),
            token_secret: "test-secret".to_string(),
            token_ttl: Duration::hours(24),
            allowed_origins: "".to_string().try_into().expect("valid origins"),
            initial_admin_handle: None,
            max_note_length: 280,
            max_feed_entries: 1000,
            max_thread_depth: 10,
            max_pagination_limit: 50,
            default_feed_page_size: 20,
            scoring: ScoringConfig {
                exp: 1.3,
                base_offset: 4.0,
                like_weight: 1.0,
                reply_weight: 10.0,
                repost_weight: 3.0,
            },
            retention: RetentionConfig {
                feed_entries: Duration::days(7),
                deleted_posts: Duration::days(30),
            },
            cache_ttl: CacheTtlConfig {
                fof_rankings: Duration::minutes(15),
                profile: Duration::hours(1),
            },
            ranker_enable: "true".to_string().try_into().expect("valid bool"),
            ranker_interval: "15m".to_string().try_into().expect("valid duration"),
            feed_gc_enable: "true".to_string().try_into().expect("valid bool"),
            feed_gc_interval: "1h".to_string().try_into().expect("valid duration"),
            compaction_enable: "true".to_string().try_into().expect("valid bool"),
            compaction_interval: "24h".to_string().try_into().expect("valid duration"),
            fanout_enable: "true".to_string().try_into().expect("valid bool"),
            fanout_batch_size: 16,
            fanout_concurrency: 16,
            fanout_poll_interval: "1s".to_string().try_into().expect("valid duration"),
            seed_users: None,
        }
    }
}
