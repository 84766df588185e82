//! # datasync-core
//!
//! 数据同步作业调度系统的核心库：数据模型、错误类型、外部协作者接口以及配置模型。
//!
//! 其余crate（infrastructure / dispatcher / pipeline / api）都只依赖这里定义的抽象，
//! 具体的存储、运行时和数据源实现通过 trait 注入。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use models::*;
pub use traits::*;
