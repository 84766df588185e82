use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    pipeline::{PipelineConfig, RegistryConfig},
    scheduler::{MonitorConfig, SchedulerConfig},
    storage::{DatabaseConfig, StoreConfig},
};

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub registry: RegistryConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 内置默认值
    /// 2. 配置文件（TOML）
    /// 3. 环境变量覆盖（前缀 `DATASYNC_`，层级分隔符 `__`，例如
    ///    `DATASYNC_SCHEDULER__MAX_WORKERS=8`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/datasync.toml",
                "datasync.toml",
                "/etc/datasync/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("DATASYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.monitor.validate().context("监控器配置验证失败")?;
        self.store.validate().context("共享存储配置验证失败")?;
        self.database.validate().context("数据库配置验证失败")?;
        self.pipeline.validate().context("管道配置验证失败")?;
        self.registry.validate().context("作业注册表配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        // 心跳必须比失联判定更频繁，否则健康任务也会被判定为失联
        if self.pipeline.heartbeat_interval_seconds as i64 >= self.monitor.stale_threshold_seconds {
            return Err(anyhow::anyhow!(
                "心跳间隔({}秒)必须小于心跳超时阈值({}秒)",
                self.pipeline.heartbeat_interval_seconds,
                self.monitor.stale_threshold_seconds
            ));
        }

        Ok(())
    }
}
