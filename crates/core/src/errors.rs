use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// 同步调度系统错误类型定义
///
/// 前七个变体对应调度与管道的错误分类：
///
/// - `Admission`: 提交时无法解析的作业类型或非法参数，不会创建任何任务记录
/// - `Dispatch`: 执行运行时拒绝提交，任务立即标记为失败，不占用槽位
/// - `Source`: 数据源拉取或认证失败，整次运行失败
/// - `Validation`: 单条记录校验失败，仅计数，不影响同批次其他记录
/// - `BulkSave`: 批量写入失败，触发该批次的逐条写入回退
/// - `StaleTask`: 监控器根据心跳超时合成的错误，按失败处理
/// - `StoreUnavailable`: 持久化存储不可达，调度器降级而不是让调用方失败
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("作业准入失败: {0}")]
    Admission(String),

    #[error("作业分发失败: {0}")]
    Dispatch(String),

    #[error("数据源错误: {0}")]
    Source(String),

    #[error("记录校验失败: {0}")]
    Validation(String),

    #[error("批量保存失败: {0}")]
    BulkSave(String),

    #[error("任务 {task_id} 心跳超时 (上次心跳: {last_heartbeat})")]
    StaleTask {
        task_id: Uuid,
        last_heartbeat: DateTime<Utc>,
    },

    #[error("持久化存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("同步运行记录未找到: {id}")]
    RunNotFound { id: i64 },

    #[error("同步运行记录 {id} 已结束，不可再修改")]
    RunAlreadyFinished { id: i64 },

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("作业已取消")]
    Cancelled,

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SyncError {
    /// 错误类别标识，用于指标标签和API错误码
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Admission(_) => "admission",
            SyncError::Dispatch(_) => "dispatch",
            SyncError::Source(_) => "source",
            SyncError::Validation(_) => "validation",
            SyncError::BulkSave(_) => "bulk_save",
            SyncError::StaleTask { .. } => "stale_task",
            SyncError::StoreUnavailable(_) => "store_unavailable",
            SyncError::TaskNotFound { .. } => "task_not_found",
            SyncError::RunNotFound { .. } => "run_not_found",
            SyncError::RunAlreadyFinished { .. } => "run_already_finished",
            SyncError::InvalidTransition { .. } => "invalid_transition",
            SyncError::Cancelled => "cancelled",
            SyncError::Database(_) => "database",
            SyncError::Serialization(_) => "serialization",
            SyncError::Configuration(_) => "configuration",
            SyncError::Internal(_) => "internal",
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, SyncError::StoreUnavailable(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type SyncResult<T> = std::result::Result<T, SyncError>;
