use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::{WireError, WireResult};
use crate::kv::StoragePool;

const LEASE_SECS: i64 = 30;
const MAX_BACKOFF_SECS: i64 = 60;

fn lease() -> Duration {
    Duration::seconds(LEASE_SECS)
}

/// Fan-out pipeline message. Consumers are idempotent, so at-least-once
/// delivery is safe. `targets` is absent on first send (the worker
/// enumerates followers); a re-enqueued message names only the timelines
/// still missing the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutMessage {
    NewPost {
        post_id: String,
        author_id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        targets: Option<Vec<String>>,
    },
    DeletePost {
        post_id: String,
        author_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        targets: Option<Vec<String>>,
    },
}

impl FanoutMessage {
    /// The same event, scoped down to the timelines that still need it.
    pub fn with_targets(&self, targets: Vec<String>) -> Self {
        match self {
            Self::NewPost {
                post_id,
                author_id,
                timestamp,
                ..
            } => Self::NewPost {
                post_id: post_id.clone(),
                author_id: author_id.clone(),
                timestamp: *timestamp,
                targets: Some(targets),
            },
            Self::DeletePost {
                post_id, author_id, ..
            } => Self::DeletePost {
                post_id: post_id.clone(),
                author_id: author_id.clone(),
                targets: Some(targets),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub attempts: u32,
    pub message: FanoutMessage,
}

/// At-least-once FIFO channel. `receive` leases up to `max` messages; each
/// lease ends in `ack` (done) or `retry` (redeliver after a backoff that
/// grows with the attempt count). Unacked leases expire and redeliver.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn send(&self, message: &FanoutMessage) -> WireResult<()>;

    async fn receive(&self, max: usize) -> WireResult<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> WireResult<()>;

    async fn retry(&self, delivery: &Delivery) -> WireResult<()>;
}

fn backoff(attempts: u32) -> Duration {
    let secs = 2i64.saturating_pow(attempts.min(6)).min(MAX_BACKOFF_SECS);
    Duration::seconds(secs)
}

#[derive(Default)]
struct MemoryQueueInner {
    next_id: i64,
    // (id, attempts, available_at, message)
    ready: VecDeque<(i64, u32, DateTime<Utc>, FanoutMessage)>,
    leased: HashMap<i64, (u32, DateTime<Utc>, FanoutMessage)>,
}

/// In-memory queue for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
    pub fn shared() -> Arc<dyn Queue> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, message: &FanoutMessage) -> WireResult<()> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.ready.push_back((id, 0, Utc::now(), message.clone()));
        Ok(())
    }

    async fn receive(&self, max: usize) -> WireResult<Vec<Delivery>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        // Expired leases go back to the front so ordering stays best-effort.
        let expired: Vec<i64> = inner
            .leased
            .iter()
            .filter(|(_, (_, leased_until, _))| *leased_until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((attempts, _, message)) = inner.leased.remove(&id) {
                inner.ready.push_front((id, attempts, now, message));
            }
        }

        let mut batch = Vec::with_capacity(max);
        let mut deferred = Vec::new();
        while batch.len() < max {
            let Some((id, attempts, available_at, message)) = inner.ready.pop_front() else {
                break;
            };
            if available_at > now {
                deferred.push((id, attempts, available_at, message));
                continue;
            }
            let attempts = attempts + 1;
            inner
                .leased
                .insert(id, (attempts, now + lease(), message.clone()));
            batch.push(Delivery {
                id,
                attempts,
                message,
            });
        }
        for item in deferred {
            inner.ready.push_back(item);
        }
        Ok(batch)
    }

    async fn ack(&self, delivery: &Delivery) -> WireResult<()> {
        let mut inner = self.inner.lock().await;
        inner.leased.remove(&delivery.id);
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery) -> WireResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some((attempts, _, message)) = inner.leased.remove(&delivery.id) {
            let available_at = Utc::now() + backoff(attempts);
            inner
                .ready
                .push_back((delivery.id, attempts, available_at, message));
        }
        Ok(())
    }
}

/// Durable queue over the shared sqlite pool, lease-based visibility.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: StoragePool,
}

impl SqliteQueue {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub fn shared(pool: StoragePool) -> Arc<dyn Queue> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn send(&self, message: &FanoutMessage) -> WireResult<()> {
        let payload = serde_json::to_string(message)?;
        let now = Utc::now().timestamp_millis();
        sqlx::query("INSERT INTO queue (payload, available_at, attempts) VALUES (?, ?, 0)")
            .bind(payload)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn receive(&self, max: usize) -> WireResult<Vec<Delivery>> {
        let now = Utc::now().timestamp_millis();
        let leased_until = (Utc::now() + lease()).timestamp_millis();

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, (i64, String, i64)>(
            "SELECT id, payload, attempts FROM queue \
             WHERE available_at <= ? AND (leased_until IS NULL OR leased_until <= ?) \
             ORDER BY id LIMIT ?",
        )
        .bind(now)
        .bind(now)
        .bind(max as i64)
        .fetch_all(tx.as_mut())
        .await?;

        let mut batch = Vec::with_capacity(rows.len());
        for (id, payload, attempts) in rows {
            sqlx::query("UPDATE queue SET leased_until = ?, attempts = attempts + 1 WHERE id = ?")
                .bind(leased_until)
                .bind(id)
                .execute(tx.as_mut())
                .await?;

            let message: FanoutMessage = serde_json::from_str(&payload)
                .map_err(|err| WireError::Internal(anyhow::Error::new(err)))?;
            batch.push(Delivery {
                id,
                attempts: (attempts + 1) as u32,
                message,
            });
        }

        tx.commit().await?;
        Ok(batch)
    }

    async fn ack(&self, delivery: &Delivery) -> WireResult<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery) -> WireResult<()> {
        let available_at = (Utc::now() + backoff(delivery.attempts)).timestamp_millis();
        sqlx::query("UPDATE queue SET leased_until = NULL, available_at = ? WHERE id = ?")
            .bind(available_at)
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    fn new_post(post_id: &str) -> FanoutMessage {
        FanoutMessage::NewPost {
            post_id: post_id.to_string(),
            author_id: "author".to_string(),
            timestamp: Utc::now(),
            targets: None,
        }
    }

    #[test]
    fn with_targets_scopes_the_event() {
        let tail = new_post("p1").with_targets(vec!["carol".to_string()]);
        match tail {
            FanoutMessage::NewPost {
                post_id, targets, ..
            } => {
                assert_eq!(post_id, "p1");
                assert_eq!(targets, Some(vec!["carol".to_string()]));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn memory_send_receive_ack() {
        let queue = MemoryQueue::default();
        queue.send(&new_post("p1")).await.unwrap();
        queue.send(&new_post("p2")).await.unwrap();

        let batch = queue.receive(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].attempts, 1);

        for delivery in &batch {
            queue.ack(delivery).await.unwrap();
        }
        assert!(queue.receive(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_retry_redelivers_with_backoff() {
        let queue = MemoryQueue::default();
        queue.send(&new_post("p1")).await.unwrap();

        let batch = queue.receive(1).await.unwrap();
        assert_eq!(batch.len(), 1);
        queue.retry(&batch[0]).await.unwrap();

        // Backed off into the future, not immediately visible.
        assert!(queue.receive(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_batch_respects_max() {
        let queue = MemoryQueue::default();
        for i in 0..5 {
            queue.send(&new_post(&format!("p{}", i))).await.unwrap();
        }
        assert_eq!(queue.receive(3).await.unwrap().len(), 3);
        assert_eq!(queue.receive(3).await.unwrap().len(), 2);
    }

    #[sqlx::test]
    async fn sqlite_send_receive_ack(pool: SqlitePool) {
        let queue = SqliteQueue::new(pool);
        queue.send(&new_post("p1")).await.unwrap();

        let batch = queue.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        match &batch[0].message {
            FanoutMessage::NewPost { post_id, .. } => assert_eq!(post_id, "p1"),
            other => panic!("unexpected message {:?}", other),
        }

        // Leased: not visible to a second consumer.
        assert!(queue.receive(10).await.unwrap().is_empty());

        queue.ack(&batch[0]).await.unwrap();
        assert!(queue.receive(10).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn sqlite_retry_backs_off(pool: SqlitePool) {
        let queue = SqliteQueue::new(pool);
        queue.send(&new_post("p1")).await.unwrap();

        let batch = queue.receive(1).await.unwrap();
        queue.retry(&batch[0]).await.unwrap();
        assert!(queue.receive(1).await.unwrap().is_empty());
    }
}
