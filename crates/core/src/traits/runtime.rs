use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    models::{ExecutionHandle, JobPayload, JobReference, RuntimeJobStatus},
    SyncResult,
};

/// 作业执行运行时接口
///
/// 调度器只通过这三个调用与运行时交互：提交、查询真实状态、请求取消。
/// `submit` 同步拒绝（例如作业引用未注册）时返回 `SyncError::Dispatch`。
#[async_trait]
pub trait JobExecutionRuntime: Send + Sync {
    async fn submit(
        &self,
        job_ref: &JobReference,
        payload: JobPayload,
    ) -> SyncResult<ExecutionHandle>;

    async fn get_status(&self, handle: &ExecutionHandle) -> SyncResult<RuntimeJobStatus>;

    /// 尽力而为的取消请求，作业在下一个批次边界观察到取消
    async fn request_cancel(&self, handle: &ExecutionHandle) -> SyncResult<()>;
}

/// 提交时对作业参数的校验，返回错误表示拒绝准入
pub type ParameterValidator = Arc<dyn Fn(&serde_json::Value) -> SyncResult<()> + Send + Sync>;
