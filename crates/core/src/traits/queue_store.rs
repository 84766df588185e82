use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::SyncResult;

/// 原子更新函数
///
/// 入参为键的当前值（不存在时为 `None`），返回 `Some(new)` 表示写入新值，
/// `None` 表示保持不变。实现可能因乐观并发冲突而多次调用该函数，因此函数必须无副作用，
/// 或只通过内部可变性记录最后一次调用的结果。
pub type UpdateFn<'a> = dyn Fn(Option<&Value>) -> SyncResult<Option<Value>> + Send + Sync + 'a;

/// 持久化队列存储接口
///
/// 所有调度器实例共享的键值存储，是槽位计数的唯一事实来源。
/// 连接类故障必须以 `SyncError::StoreUnavailable` 返回，调度器据此降级。
#[async_trait]
pub trait PersistentQueueStore: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>>;

    /// 写入值，`ttl` 为 `None` 时永久保存
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> SyncResult<()>;

    async fn delete(&self, key: &str) -> SyncResult<bool>;

    /// 原子读-改-写，返回更新后（或未变更时的当前）值。写入的值不带TTL。
    async fn atomic_update(&self, key: &str, update: &UpdateFn<'_>) -> SyncResult<Option<Value>>;

    async fn health_check(&self) -> SyncResult<()> {
        self.get("__health__").await.map(|_| ())
    }
}
