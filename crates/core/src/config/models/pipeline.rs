use serde::{Deserialize, Serialize};

/// 同步管道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 数据源每批拉取的记录数
    pub batch_size: usize,
    /// 心跳最小间隔（秒），批次边界上超过该间隔才刷新
    pub heartbeat_interval_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            heartbeat_interval_seconds: 15,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("批大小必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        Ok(())
    }
}

/// 作业注册表中的一条显式映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub source_system: String,
    pub operation: String,
    pub job_ref: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub jobs: Vec<RegistryEntry>,
}

impl RegistryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for entry in &self.jobs {
            if entry.source_system.is_empty() || entry.operation.is_empty() {
                return Err(anyhow::anyhow!(
                    "注册表条目的数据源和操作不能为空: {:?}",
                    entry
                ));
            }
            if entry.job_ref.is_empty() {
                return Err(anyhow::anyhow!(
                    "注册表条目 {}/{} 的作业引用不能为空",
                    entry.source_system,
                    entry.operation
                ));
            }
        }

        Ok(())
    }
}
