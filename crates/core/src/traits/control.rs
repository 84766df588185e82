use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    models::{ExecutionHandle, JobPayload},
    SyncResult,
};

/// 运行中作业与调度状态之间的控制通道
///
/// 作业通过它刷新心跳、轮询共享状态中的取消标记。
#[async_trait]
pub trait TaskControl: Send + Sync {
    async fn heartbeat(&self, task_id: Uuid) -> SyncResult<()>;

    async fn is_cancel_requested(&self, task_id: Uuid) -> SyncResult<bool>;
}

/// 作业执行上下文
#[derive(Debug, Clone)]
pub struct JobContext {
    pub payload: JobPayload,
    pub handle: ExecutionHandle,
    /// 运行时在收到取消请求时触发
    pub cancellation: CancellationToken,
}

/// 运行时中注册的作业处理器
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// 执行作业，成功时返回可选的结果摘要
    async fn run(&self, ctx: JobContext) -> SyncResult<Option<serde_json::Value>>;
}
