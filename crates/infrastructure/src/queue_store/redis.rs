use std::time::Duration;

use async_trait::async_trait;
use datasync_core::{PersistentQueueStore, StoreConfig, SyncError, SyncResult, UpdateFn};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use serde_json::Value;
use tracing::{debug, warn};

/// 仅当键的当前值与预期值一致时写入，预期值为空串表示键必须不存在
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
    if current then return 0 end
else
    if current ~= ARGV[1] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// 基于Redis的共享存储
///
/// 值以JSON字符串保存。`atomic_update` 使用乐观并发：读取当前值、在本地计算新值，
/// 再通过Lua脚本比较并写入，冲突时重试，超过 `max_cas_retries` 次按存储不可用处理。
pub struct RedisQueueStore {
    connection: ConnectionManager,
    compare_and_set: Script,
    max_cas_retries: u32,
}

impl RedisQueueStore {
    pub async fn new(config: &StoreConfig) -> SyncResult<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| SyncError::StoreUnavailable(format!("创建Redis客户端失败: {e}")))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| SyncError::StoreUnavailable(format!("连接Redis失败: {e}")))?;

        debug!("已连接Redis共享存储: {}", config.redis_url);

        Ok(Self {
            connection,
            compare_and_set: Script::new(COMPARE_AND_SET),
            max_cas_retries: config.max_cas_retries,
        })
    }

    fn store_error(op: &str, key: &str, e: RedisError) -> SyncError {
        SyncError::StoreUnavailable(format!("Redis {op} 失败 (key={key}): {e}"))
    }

    async fn get_raw(&self, key: &str) -> SyncResult<Option<String>> {
        let mut conn = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::store_error("GET", key, e))
    }
}

#[async_trait]
impl PersistentQueueStore for RedisQueueStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> SyncResult<()> {
        let payload = serde_json::to_string(&value)?;
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::store_error("SET", key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::store_error("DEL", key, e))?;
        Ok(removed > 0)
    }

    async fn atomic_update(&self, key: &str, update: &UpdateFn<'_>) -> SyncResult<Option<Value>> {
        for attempt in 0..self.max_cas_retries {
            let raw = self.get_raw(key).await?;
            let current = match &raw {
                Some(raw) => Some(serde_json::from_str::<Value>(raw)?),
                None => None,
            };

            let new_value = match update(current.as_ref())? {
                Some(value) => value,
                None => return Ok(current),
            };

            let mut conn = self.connection.clone();
            let applied: i64 = self
                .compare_and_set
                .key(key)
                .arg(raw.as_deref().unwrap_or(""))
                .arg(serde_json::to_string(&new_value)?)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| Self::store_error("EVALSHA", key, e))?;

            if applied == 1 {
                return Ok(Some(new_value));
            }
            debug!("原子更新冲突，重试 (key={}, attempt={})", key, attempt + 1);
        }

        warn!(
            "原子更新在 {} 次重试后仍然冲突 (key={})",
            self.max_cas_retries, key
        );
        Err(SyncError::StoreUnavailable(format!(
            "原子更新冲突次数超过上限 (key={key})"
        )))
    }

    async fn health_check(&self) -> SyncResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::store_error("PING", "-", e))?;
        debug!("Redis健康检查: {}", pong);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::redis::Redis;

    #[tokio::test]
    async fn test_unreachable_redis_is_store_unavailable() {
        let config = StoreConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let result = RedisQueueStore::new(&config).await;
        assert!(matches!(result, Err(SyncError::StoreUnavailable(_))));
    }

    #[tokio::test]
    #[ignore] // 需要Docker环境
    async fn test_redis_store_against_container() {
        let container = Redis::default().start().await.unwrap();
        let port = container.get_host_port_ipv4(6379).await.unwrap();
        let config = StoreConfig {
            redis_url: format!("redis://127.0.0.1:{port}"),
            ..Default::default()
        };
        let store = Arc::new(RedisQueueStore::new(&config).await.unwrap());
        store.health_check().await.unwrap();

        store.set("k", json!({"a": 1}), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert!(store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .atomic_update("counter", &|current| {
                        let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
                        Ok(Some(json!(n + 1)))
                    })
                    .await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(ok)));
    }
}
