//! 外部协作者接口
//!
//! - [`PersistentQueueStore`]: 所有调度器实例共享的键值存储，承载队列与活跃槽位状态
//! - [`JobExecutionRuntime`]: 实际执行作业的异步运行时
//! - [`SyncRunRepository`]: 同步运行审计记录的存储
//! - [`JobHandler`] / [`TaskControl`]: 运行时侧执行作业、回报心跳和轮询取消标记

pub mod control;
pub mod queue_store;
pub mod repository;
pub mod runtime;

pub use control::*;
pub use queue_store::*;
pub use repository::*;
pub use runtime::*;
