//! 调度状态共享存储实现
//!
//! 两个实现遵循同样的约定：值以JSON保存，`atomic_update` 的更新函数返回 `None`
//! 表示不写入，连接类故障统一返回 `SyncError::StoreUnavailable`。

pub mod in_memory;
pub mod redis;

pub use self::in_memory::InMemoryQueueStore;
pub use self::redis::RedisQueueStore;
