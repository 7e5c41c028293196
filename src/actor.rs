use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::errors::{WireError, WireResult};
use crate::kv::{self, KvStore};

/// Durable actor state. Mutations are applied to a clone and only committed
/// once the persisted write succeeds, so `Clone` is part of the contract.
pub trait ActorState: Clone + Serialize + DeserializeOwned + Send + 'static {}

impl<T: Clone + Serialize + DeserializeOwned + Send + 'static> ActorState for T {}

struct Cell<S> {
    loaded: bool,
    state: Option<S>,
}

impl<S> Default for Cell<S> {
    fn default() -> Self {
        Self {
            loaded: false,
            state: None,
        }
    }
}

/// Hosts the single-writer actors of one namespace. Each named actor is
/// backed by a storage blob at `{namespace}:{name}` and an in-memory cell
/// guarded by its own mutex: at most one operation runs per actor, further
/// callers queue on the lock. Cells live for the process lifetime.
pub struct ActorHost<S> {
    kv: Arc<dyn KvStore>,
    namespace: &'static str,
    cells: Mutex<HashMap<String, Arc<Mutex<Cell<S>>>>>,
}

impl<S: ActorState> ActorHost<S> {
    pub fn new(kv: Arc<dyn KvStore>, namespace: &'static str) -> Arc<Self> {
        Arc::new(Self {
            kv,
            namespace,
            cells: Mutex::new(HashMap::new()),
        })
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    async fn cell(&self, name: &str) -> Arc<Mutex<Cell<S>>> {
        let mut cells = self.cells.lock().await;
        cells.entry(name.to_string()).or_default().clone()
    }

    async fn load(&self, name: &str, cell: &mut Cell<S>) -> WireResult<()> {
        if !cell.loaded {
            cell.state = kv::get_json(self.kv.as_ref(), &self.key(name)).await?;
            cell.loaded = true;
        }
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> WireResult<bool> {
        let cell = self.cell(name).await;
        let mut guard = cell.lock().await;
        self.load(name, &mut guard).await?;
        Ok(guard.state.is_some())
    }

    /// Create the actor. Fails with `Conflict` if state already exists.
    pub async fn init(&self, name: &str, state: S) -> WireResult<()> {
        let cell = self.cell(name).await;
        let mut guard = cell.lock().await;
        self.load(name, &mut guard).await?;
        if guard.state.is_some() {
            return Err(WireError::conflict(format!(
                "{} already exists",
                self.key(name)
            )));
        }
        kv::put_json(self.kv.as_ref(), &self.key(name), &state, None)
            .await
            .map_err(transient)?;
        guard.state = Some(state);
        Ok(())
    }

    pub async fn read<T>(&self, name: &str, f: impl FnOnce(&S) -> T) -> WireResult<T> {
        let cell = self.cell(name).await;
        let mut guard = cell.lock().await;
        self.load(name, &mut guard).await?;
        let state = guard
            .state
            .as_ref()
            .ok_or_else(|| WireError::NotInitialized(self.key(name)))?;
        Ok(f(state))
    }

    /// Read that tolerates absence, for callers probing optional actors.
    pub async fn try_read<T>(&self, name: &str, f: impl FnOnce(&S) -> T) -> WireResult<Option<T>> {
        let cell = self.cell(name).await;
        let mut guard = cell.lock().await;
        self.load(name, &mut guard).await?;
        Ok(guard.state.as_ref().map(f))
    }

    /// Apply a mutation and persist it. The handler runs against a clone;
    /// the cell only sees the new state after the storage write succeeds, so
    /// a failed persist leaves no observable change.
    pub async fn update<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut S) -> WireResult<T>,
    ) -> WireResult<T> {
        let cell = self.cell(name).await;
        let mut guard = cell.lock().await;
        self.load(name, &mut guard).await?;
        let current = guard
            .state
            .as_ref()
            .ok_or_else(|| WireError::NotInitialized(self.key(name)))?;

        let mut next = current.clone();
        let out = f(&mut next)?;
        kv::put_json(self.kv.as_ref(), &self.key(name), &next, None)
            .await
            .map_err(transient)?;
        guard.state = Some(next);
        Ok(out)
    }

    /// Like `update`, but runs `followup` with a copy of the committed state
    /// before releasing the actor. Side effects issued here are serialized
    /// with the actor's operation order, which plain `update` callers cannot
    /// guarantee once the lock is gone.
    pub async fn update_then<T, Fut>(
        &self,
        name: &str,
        f: impl FnOnce(&mut S) -> WireResult<T>,
        followup: impl FnOnce(S) -> Fut,
    ) -> WireResult<T>
    where
        Fut: std::future::Future<Output = WireResult<()>>,
    {
        let cell = self.cell(name).await;
        let mut guard = cell.lock().await;
        self.load(name, &mut guard).await?;
        let current = guard
            .state
            .as_ref()
            .ok_or_else(|| WireError::NotInitialized(self.key(name)))?;

        let mut next = current.clone();
        let out = f(&mut next)?;
        kv::put_json(self.kv.as_ref(), &self.key(name), &next, None)
            .await
            .map_err(transient)?;
        let committed = next.clone();
        guard.state = Some(next);

        followup(committed).await?;
        Ok(out)
    }

    /// Drop the actor's blob and cell. Used by compaction.
    pub async fn remove(&self, name: &str) -> WireResult<()> {
        let cell = self.cell(name).await;
        let mut guard = cell.lock().await;
        self.kv.delete(&self.key(name)).await?;
        guard.loaded = true;
        guard.state = None;
        Ok(())
    }
}

fn transient(err: WireError) -> WireError {
    match err {
        WireError::Transient(inner) => WireError::Transient(inner),
        WireError::Internal(inner) => WireError::Transient(inner),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::kv::{MemoryKv, Scan};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    #[tokio::test]
    async fn init_then_update_then_read() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
        let host = ActorHost::<Counter>::new(kv, "counter");

        host.init("a", Counter { value: 0 }).await.unwrap();
        let value = host
            .update("a", |state| {
                state.value += 1;
                Ok(state.value)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(host.read("a", |state| state.value).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn double_init_conflicts() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
        let host = ActorHost::<Counter>::new(kv, "counter");

        host.init("a", Counter { value: 0 }).await.unwrap();
        let err = host.init("a", Counter { value: 9 }).await.unwrap_err();
        assert!(matches!(err, WireError::Conflict(_)));
    }

    #[tokio::test]
    async fn uninitialized_read_fails() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
        let host = ActorHost::<Counter>::new(kv, "counter");

        let err = host.read("ghost", |state| state.value).await.unwrap_err();
        assert!(matches!(err, WireError::NotInitialized(_)));
        assert_eq!(host.try_read("ghost", |s| s.value).await.unwrap(), None);
        assert!(!host.exists("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn state_survives_cold_cells() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
        {
            let host = ActorHost::<Counter>::new(kv.clone(), "counter");
            host.init("a", Counter { value: 41 }).await.unwrap();
            host.update("a", |state| {
                state.value += 1;
                Ok(())
            })
            .await
            .unwrap();
        }

        // Fresh host: no warm cell, must reload from storage.
        let host = ActorHost::<Counter>::new(kv, "counter");
        assert_eq!(host.read("a", |state| state.value).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn serialized_updates_do_not_interleave() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
        let host = ActorHost::<Counter>::new(kv, "counter");
        host.init("a", Counter { value: 0 }).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let host = host.clone();
            tasks.push(tokio::spawn(async move {
                host.update("a", |state| {
                    state.value += 1;
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(host.read("a", |state| state.value).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn update_then_serializes_followups() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
        let host = ActorHost::<Counter>::new(kv.clone(), "counter");
        host.init("a", Counter { value: 0 }).await.unwrap();

        // Each mutation mirrors its committed value into a second key while
        // still holding the actor; the mirror must end at the final value.
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let host = host.clone();
            let kv = kv.clone();
            tasks.push(tokio::spawn(async move {
                host.update_then(
                    "a",
                    |state| {
                        state.value += 1;
                        Ok(())
                    },
                    move |committed| async move {
                        kv.put("mirror", &committed.value.to_string(), None).await
                    },
                )
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(kv.get("mirror").await.unwrap(), Some("10".to_string()));
    }

    /// Store that fails writes on demand, to observe persist-failure
    /// semantics.
    struct FlakyKv {
        inner: MemoryKv,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl KvStore for FlakyKv {
        async fn get(&self, key: &str) -> WireResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> WireResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(WireError::Transient(anyhow::anyhow!("disk unplugged")));
            }
            self.inner.put(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> WireResult<()> {
            self.inner.delete(key).await
        }

        async fn list(
            &self,
            prefix: &str,
            limit: usize,
            cursor: Option<String>,
        ) -> WireResult<Scan> {
            self.inner.list(prefix, limit, cursor).await
        }

        async fn purge_expired(&self) -> WireResult<u64> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn failed_persist_leaves_no_observable_change() {
        let flaky = Arc::new(FlakyKv {
            inner: MemoryKv::default(),
            fail_writes: AtomicBool::new(false),
        });
        let host = ActorHost::<Counter>::new(flaky.clone(), "counter");
        host.init("a", Counter { value: 7 }).await.unwrap();

        flaky.fail_writes.store(true, Ordering::SeqCst);
        let err = host
            .update("a", |state| {
                state.value = 99;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        flaky.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(host.read("a", |state| state.value).await.unwrap(), 7);
    }
}
