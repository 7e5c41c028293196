use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{WireError, WireResult};
use crate::kv::{self, KvStore};

/// Fixed-window counters persisted at `rl:{bucket}:{identifier}` with a TTL
/// of one window, so abandoned windows expire on their own and compaction
/// sweeps the rest.
#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Window {
    count: u32,
    started_at: DateTime<Utc>,
}

fn window_key(bucket: &str, identifier: &str) -> String {
    format!("rl:{}:{}", bucket, identifier)
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Count one hit; errors with `RateLimited` once `max` hits land inside
    /// the window.
    pub async fn check(
        &self,
        bucket: &str,
        identifier: &str,
        max: u32,
        window: Duration,
    ) -> WireResult<()> {
        let key = window_key(bucket, identifier);
        let now = Utc::now();

        let current: Option<Window> = kv::get_json(self.kv.as_ref(), &key).await?;
        let mut state = match current {
            Some(state) if now - state.started_at < window => state,
            _ => Window {
                count: 0,
                started_at: now,
            },
        };

        if state.count >= max {
            let elapsed = now - state.started_at;
            let retry_after_secs = (window - elapsed).num_seconds().max(1) as u64;
            return Err(WireError::RateLimited { retry_after_secs });
        }

        state.count += 1;
        kv::put_json(self.kv.as_ref(), &key, &state, Some(window)).await?;
        Ok(())
    }
}
