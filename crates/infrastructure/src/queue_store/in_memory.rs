use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use datasync_core::{PersistentQueueStore, SyncResult, UpdateFn};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 内存共享存储
///
/// 单进程部署和测试使用；同时作为调度器在共享存储不可达时的降级视图。
/// 过期键在读取时惰性清除，`atomic_update` 在锁内完成读-改-写。
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前未过期的键数量
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|v| !v.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn live_value<'a>(
        entries: &'a mut HashMap<String, StoredValue>,
        key: &str,
        now: Instant,
    ) -> Option<&'a Value> {
        if entries.get(key).is_some_and(|v| v.is_expired(now)) {
            debug!("键已过期，清除: {}", key);
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|v| &v.value)
    }
}

#[async_trait]
impl PersistentQueueStore for InMemoryQueueStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live_value(&mut entries, key, Instant::now()).cloned())
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> SyncResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|v| !v.is_expired(now)))
    }

    async fn atomic_update(&self, key: &str, update: &UpdateFn<'_>) -> SyncResult<Option<Value>> {
        let mut entries = self.entries.lock().await;
        let current = Self::live_value(&mut entries, key, Instant::now()).cloned();

        match update(current.as_ref())? {
            Some(new_value) => {
                entries.insert(
                    key.to_string(),
                    StoredValue {
                        value: new_value.clone(),
                        expires_at: None,
                    },
                );
                Ok(Some(new_value))
            }
            None => Ok(current),
        }
    }

    async fn health_check(&self) -> SyncResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = InMemoryQueueStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.set("a", json!({"n": 1}), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"n": 1})));

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryQueueStore::new();
        store
            .set("short", json!(1), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("long", json!(2), None).await.unwrap();
        assert_eq!(store.len().await, 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.get("long").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_atomic_update_none_keeps_value() {
        let store = InMemoryQueueStore::new();
        store.set("k", json!(5), None).await.unwrap();

        let after = store.atomic_update("k", &|_| Ok(None)).await.unwrap();
        assert_eq!(after, Some(json!(5)));

        let after = store
            .atomic_update("k", &|current| {
                let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(Some(json!(n + 1)))
            })
            .await
            .unwrap();
        assert_eq!(after, Some(json!(6)));
    }

    #[tokio::test]
    async fn test_concurrent_atomic_increments() {
        let store = std::sync::Arc::new(InMemoryQueueStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .atomic_update("counter", &|current| {
                        let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
                        Ok(Some(json!(n + 1)))
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(50)));
    }
}
