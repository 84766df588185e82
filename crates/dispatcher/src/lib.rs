//! # datasync-dispatcher
//!
//! 调度侧组件：作业注册表、调度状态客户端、工作池调度器、对账监控器和完成事件监听器。

pub mod listener;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use listener::CompletionListener;
pub use monitor::{ReconciliationMonitor, SweepReport};
pub use registry::JobRegistry;
pub use scheduler::{SchedulerStats, WorkerPoolScheduler};
pub use state::{QueueEntry, SchedulerCounters, SchedulerStateStore};
