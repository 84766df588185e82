//! 配置管理
//!
//! `AppConfig` 汇总各组件的配置段，支持TOML文件加 `DATASYNC_` 前缀环境变量覆盖。
//! 每个配置段提供 `validate()`，由 `AppConfig::validate` 统一调用并附加上下文。

pub mod models;

#[cfg(test)]
mod config_test;

pub use models::*;
