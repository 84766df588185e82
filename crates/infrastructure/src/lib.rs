//! # datasync-infrastructure
//!
//! 核心接口的具体实现：
//!
//! - `queue_store`: 共享调度状态存储（内存 / Redis）
//! - `database`: 同步运行审计记录仓库（内存 / SQLite）
//! - `runtime`: 进程内的作业执行运行时
//! - `observability`: 结构化日志、指标采集和日志初始化

pub mod database;
pub mod observability;
pub mod queue_store;
pub mod runtime;

pub use database::*;
pub use observability::*;
pub use queue_store::*;
pub use runtime::*;
