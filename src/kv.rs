use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tokio::sync::RwLock;

use crate::errors::{WireError, WireResult};

pub type StoragePool = Pool<Sqlite>;

/// One page of a prefix scan. The cursor is stable within a scan: pages do
/// not repeat keys even when records are inserted mid-scan.
#[derive(Debug, Clone)]
pub struct Scan {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
    pub done: bool,
}

/// Prefix-scanned, TTL-aware blob store. `put` is last-writer-wins. TTL is
/// advisory: expired keys are invisible to reads and physically removed by
/// `purge_expired` during compaction.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> WireResult<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> WireResult<()>;

    async fn delete(&self, key: &str) -> WireResult<()>;

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<String>) -> WireResult<Scan>;

    async fn purge_expired(&self) -> WireResult<u64>;
}

pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> WireResult<Option<T>> {
    match kv.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("malformed blob at {}", key))
                .map_err(WireError::Internal)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> WireResult<()> {
    let raw = serde_json::to_string(value)?;
    kv.put(key, &raw, ttl).await
}

/// Exclusive upper bound for keys starting with `prefix`, so range scans can
/// use plain key comparisons.
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < u8::MAX {
            bytes.push(last + 1);
            return String::from_utf8(bytes).ok();
        }
    }
    None
}

fn expires_at(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.map(|ttl| Utc::now() + ttl)
}

/// In-memory store used by unit tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, (String, Option<DateTime<Utc>>)>>,
}

impl MemoryKv {
    pub fn shared() -> Arc<dyn KvStore> {
        Arc::new(Self::default())
    }
}

fn live(deadline: &Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    deadline.map(|at| at > now).unwrap_or(true)
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> WireResult<Option<String>> {
        let entries = self.entries.read().await;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|(_, deadline)| live(deadline, now))
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> WireResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.to_string(), expires_at(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> WireResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<String>) -> WireResult<Scan> {
        let entries = self.entries.read().await;
        let now = Utc::now();

        // A cursor is the last key of the previous page and must not repeat.
        let after_cursor = cursor.is_some();
        let start = cursor.unwrap_or_else(|| prefix.to_string());
        let upper = prefix_upper_bound(prefix);

        let mut keys = Vec::with_capacity(limit);
        let mut more = false;
        for (key, (_, deadline)) in entries.range(start.clone()..) {
            if let Some(upper) = &upper {
                if key >= upper {
                    break;
                }
            }
            if after_cursor && key == &start {
                continue;
            }
            if !live(deadline, now) {
                continue;
            }
            if keys.len() == limit {
                more = true;
                break;
            }
            keys.push(key.clone());
        }

        let next_cursor = if more { keys.last().cloned() } else { None };
        Ok(Scan {
            done: !more,
            keys,
            next_cursor,
        })
    }

    async fn purge_expired(&self) -> WireResult<u64> {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, (_, deadline)| live(deadline, now));
        Ok((before - entries.len()) as u64)
    }
}

/// Durable store over the shared sqlite pool.
#[derive(Clone)]
pub struct SqliteKv {
    pool: StoragePool,
}

impl SqliteKv {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub fn shared(pool: StoragePool) -> Arc<dyn KvStore> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> WireResult<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> WireResult<()> {
        let expires_at = expires_at(ttl).map(|at| at.timestamp_millis());
        sqlx::query("INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> WireResult<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<String>) -> WireResult<Scan> {
        let now = Utc::now().timestamp_millis();
        let upper = prefix_upper_bound(prefix);

        // `key >= ?` for the first page, `key > ?` after a cursor; no upper
        // bound when the prefix has none (empty prefix scans everything).
        let mut query = String::from("SELECT key FROM kv WHERE ");
        query.push_str(if cursor.is_some() {
            "key > ?"
        } else {
            "key >= ?"
        });
        if upper.is_some() {
            query.push_str(" AND key < ?");
        }
        query.push_str(" AND (expires_at IS NULL OR expires_at > ?) ORDER BY key LIMIT ?");

        let start = cursor.unwrap_or_else(|| prefix.to_string());

        let mut statement = sqlx::query_scalar::<_, String>(&query).bind(&start);
        if let Some(upper) = &upper {
            statement = statement.bind(upper);
        }
        let keys = statement
            .bind(now)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?;

        let more = keys.len() > limit;
        let keys: Vec<String> = keys.into_iter().take(limit).collect();
        let next_cursor = if more { keys.last().cloned() } else { None };
        Ok(Scan {
            done: !more,
            keys,
            next_cursor,
        })
    }

    async fn purge_expired(&self) -> WireResult<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    #[tokio::test]
    async fn memory_put_get_delete() {
        let kv = MemoryKv::default();
        assert_eq!(kv.get("a").await.unwrap(), None);

        kv.put("a", "1", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));

        kv.put("a", "2", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("2".to_string()));

        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_ttl_hides_expired() {
        let kv = MemoryKv::default();
        kv.put("gone", "x", Some(Duration::milliseconds(-1)))
            .await
            .unwrap();
        kv.put("kept", "y", Some(Duration::hours(1))).await.unwrap();

        assert_eq!(kv.get("gone").await.unwrap(), None);
        assert_eq!(kv.get("kept").await.unwrap(), Some("y".to_string()));

        let scan = kv.list("", 10, None).await.unwrap();
        assert_eq!(scan.keys, vec!["kept".to_string()]);

        assert_eq!(kv.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_list_pages_with_cursor() {
        let kv = MemoryKv::default();
        for i in 0..5 {
            kv.put(&format!("post:{}", i), "{}", None).await.unwrap();
        }
        kv.put("user:1", "{}", None).await.unwrap();

        let first = kv.list("post:", 2, None).await.unwrap();
        assert_eq!(first.keys, vec!["post:0", "post:1"]);
        assert!(!first.done);

        let second = kv.list("post:", 2, first.next_cursor).await.unwrap();
        assert_eq!(second.keys, vec!["post:2", "post:3"]);

        let third = kv.list("post:", 2, second.next_cursor).await.unwrap();
        assert_eq!(third.keys, vec!["post:4"]);
        assert!(third.done);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn json_round_trip() {
        let kv = MemoryKv::default();
        put_json(&kv, "blob", &vec![1u32, 2, 3], None).await.unwrap();
        let value: Option<Vec<u32>> = get_json(&kv, "blob").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[sqlx::test]
    async fn sqlite_round_trip(pool: SqlitePool) {
        let kv = SqliteKv::new(pool);
        kv.put("a", "1", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));

        kv.put("a", "2", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("2".to_string()));

        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[sqlx::test]
    async fn sqlite_ttl_and_purge(pool: SqlitePool) {
        let kv = SqliteKv::new(pool);
        kv.put("gone", "x", Some(Duration::milliseconds(-1)))
            .await
            .unwrap();
        kv.put("kept", "y", None).await.unwrap();

        assert_eq!(kv.get("gone").await.unwrap(), None);
        let scan = kv.list("", 10, None).await.unwrap();
        assert_eq!(scan.keys, vec!["kept".to_string()]);

        assert_eq!(kv.purge_expired().await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn sqlite_list_pages_with_cursor(pool: SqlitePool) {
        let kv = SqliteKv::new(pool);
        for i in 0..5 {
            kv.put(&format!("post:{}", i), "{}", None).await.unwrap();
        }
        kv.put("queue:1", "{}", None).await.unwrap();

        let first = kv.list("post:", 3, None).await.unwrap();
        assert_eq!(first.keys, vec!["post:0", "post:1", "post:2"]);
        assert!(!first.done);

        let rest = kv.list("post:", 3, first.next_cursor).await.unwrap();
        assert_eq!(rest.keys, vec!["post:3", "post:4"]);
        assert!(rest.done);
    }
}
