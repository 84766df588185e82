//! # datasync
//!
//! 数据同步作业调度服务的启动组装：[`app::Application`] 负责构建并运行各组件，
//! [`shutdown`] 负责把进程信号转换为共享的停止令牌。

pub mod app;
pub mod shutdown;
