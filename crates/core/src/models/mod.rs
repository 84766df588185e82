//! # 数据模型
//!
//! 调度层与管道层共享的数据结构。
//!
//! ## 核心模型
//!
//! ### TaskRecord - 调度任务记录
//! 调度器视角下的一次作业提交，跟踪排队、运行、完成/失败/取消状态以及心跳。
//!
//! ### SyncRunRecord - 同步运行审计记录
//! 管道每执行一次追加一条，记录策略配置、处理计数和性能指标；结束后不可变。
//!
//! ### JobKind / JobReference / ExecutionHandle - 作业标识
//! `(source_system, operation)` 二元组、运行时可解析的作业引用、运行时返回的执行句柄。
//!
//! 所有时间字段统一使用 `DateTime<Utc>`，状态字段使用枚举避免非法取值。

pub mod job;
pub mod sync_run;
pub mod task;

pub use job::*;
pub use sync_run::*;
pub use task::*;
