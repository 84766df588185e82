//! 可观测性
//!
//! - `structured_logger`: 带 `event` 字段的结构化事件日志
//! - `metrics_collector`: 基于 `metrics` 的计数器、仪表和直方图
//! - `logging`: 日志订阅器和Prometheus导出器的初始化

pub mod logging;
pub mod metrics_collector;
pub mod structured_logger;

pub use logging::{init_logging, init_metrics};
pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
