use serde::{Deserialize, Serialize};

/// 工作池调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 全局同时运行的任务上限
    pub max_workers: usize,
    /// 共享存储中调度状态的键前缀
    pub key_prefix: String,
    /// 终态任务记录在存储中的保留时间（秒）
    pub terminal_record_ttl_seconds: u64,
    /// 调度器实例标识，留空时由启动程序使用主机名
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            key_prefix: "datasync:scheduler".to_string(),
            terminal_record_ttl_seconds: 86_400,
            instance_id: String::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow::anyhow!("最大并发Worker数必须大于0"));
        }

        if self.key_prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("调度状态键前缀不能为空"));
        }

        if self.terminal_record_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("终态任务记录保留时间必须大于0"));
        }

        Ok(())
    }
}

/// 对账监控器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// 对账间隔（秒）
    pub sweep_interval_seconds: u64,
    /// 心跳超时阈值（秒），超过即判定为失联任务
    pub stale_threshold_seconds: i64,
    /// 每轮对账附加的随机抖动上限（毫秒），避免多实例同步扫描
    pub jitter_millis: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_seconds: 3,
            stale_threshold_seconds: 120,
            jitter_millis: 250,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("对账间隔必须大于0"));
        }

        if self.stale_threshold_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时阈值必须大于0"));
        }

        Ok(())
    }
}
