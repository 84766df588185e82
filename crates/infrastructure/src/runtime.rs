use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use datasync_core::{
    ExecutionHandle, JobCompletion, JobContext, JobExecutionRuntime, JobHandler, JobPayload,
    JobReference, RuntimeJobStatus, SyncError, SyncResult, TaskOutcome,
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 默认保留的已结束作业数量
pub const DEFAULT_FINISHED_RETENTION: usize = 256;

struct JobEntry {
    task_id: Uuid,
    status: RuntimeJobStatus,
    cancellation: CancellationToken,
}

/// 作业表：已结束的作业按结束顺序只保留最近的一部分
#[derive(Default)]
struct JobTable {
    entries: HashMap<ExecutionHandle, JobEntry>,
    finished: VecDeque<ExecutionHandle>,
}

impl JobTable {
    fn finish(&mut self, handle: &ExecutionHandle, status: RuntimeJobStatus, retention: usize) {
        let Some(entry) = self.entries.get_mut(handle) else {
            return;
        };
        entry.status = status;
        self.finished.push_back(handle.clone());
        while self.finished.len() > retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

/// 进程内作业执行运行时
///
/// 作业引用映射到已注册的 [`JobHandler`]，每次提交在独立的tokio任务中执行。
/// 配置了完成通道时，作业结束后推送 [`JobCompletion`]，调度器据此立即释放槽位；
/// 未配置时依赖监控器轮询 `get_status`。
///
/// 已结束作业的状态只保留最近 `finished_retention` 个，更早的句柄查询结果为 `Unknown`。
pub struct LocalJobRuntime {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    jobs: Arc<RwLock<JobTable>>,
    completions: Option<mpsc::UnboundedSender<JobCompletion>>,
    finished_retention: usize,
}

impl LocalJobRuntime {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            jobs: Arc::new(RwLock::new(JobTable::default())),
            completions: None,
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }

    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    /// 创建带完成通道的运行时，返回通道接收端
    pub fn with_completions() -> (Self, mpsc::UnboundedReceiver<JobCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Self {
            completions: Some(tx),
            ..Self::new()
        };
        (runtime, rx)
    }

    pub async fn register(&self, job_ref: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = job_ref.into();
        info!("注册作业处理器: {}", name);
        self.handlers.write().await.insert(name, handler);
    }

    pub async fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 正在执行（未结束）的作业数量
    pub async fn active_jobs(&self) -> usize {
        self.jobs
            .read()
            .await
            .entries
            .values()
            .filter(|entry| !entry.status.is_finished())
            .count()
    }

    /// 作业表中的条目数量，包括保留的已结束作业
    pub async fn tracked_jobs(&self) -> usize {
        self.jobs.read().await.entries.len()
    }
}

impl Default for LocalJobRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutionRuntime for LocalJobRuntime {
    async fn submit(
        &self,
        job_ref: &JobReference,
        payload: JobPayload,
    ) -> SyncResult<ExecutionHandle> {
        let handler = self
            .handlers
            .read()
            .await
            .get(job_ref.as_str())
            .cloned()
            .ok_or_else(|| SyncError::Dispatch(format!("作业引用未注册: {job_ref}")))?;

        let handle = ExecutionHandle::new(Uuid::new_v4().to_string());
        let cancellation = CancellationToken::new();
        let task_id = payload.task_id;

        self.jobs.write().await.entries.insert(
            handle.clone(),
            JobEntry {
                task_id,
                status: RuntimeJobStatus::Pending,
                cancellation: cancellation.clone(),
            },
        );

        let ctx = JobContext {
            payload,
            handle: handle.clone(),
            cancellation,
        };
        let jobs = self.jobs.clone();
        let completions = self.completions.clone();
        let job_handle = handle.clone();
        let job_ref = job_ref.clone();
        let retention = self.finished_retention;

        tokio::spawn(async move {
            if let Some(entry) = jobs.write().await.entries.get_mut(&job_handle) {
                entry.status = RuntimeJobStatus::Running;
            }
            debug!("开始执行作业: {} (task={}, handle={})", job_ref, task_id, job_handle);

            // 在独立任务中运行处理器，panic 以 JoinError 形式返回
            let result = tokio::spawn(async move { handler.run(ctx).await }).await;

            let (status, outcome) = match result {
                Ok(Ok(result)) => (
                    RuntimeJobStatus::Succeeded {
                        result: result.clone(),
                    },
                    TaskOutcome::Succeeded { result },
                ),
                Ok(Err(SyncError::Cancelled)) => (
                    RuntimeJobStatus::Cancelled,
                    TaskOutcome::failed(SyncError::Cancelled.to_string()),
                ),
                Ok(Err(e)) => (
                    RuntimeJobStatus::Failed {
                        error: e.to_string(),
                    },
                    TaskOutcome::failed(e.to_string()),
                ),
                Err(join_error) => {
                    error!("作业处理器异常退出: {} ({})", job_ref, join_error);
                    let error = format!("作业处理器异常退出: {join_error}");
                    (
                        RuntimeJobStatus::Failed {
                            error: error.clone(),
                        },
                        TaskOutcome::failed(error),
                    )
                }
            };

            jobs.write().await.finish(&job_handle, status, retention);

            if let Some(tx) = completions {
                let completion = JobCompletion {
                    task_id,
                    handle: job_handle,
                    outcome,
                    finished_at: Utc::now(),
                };
                if tx.send(completion).is_err() {
                    warn!("完成通道已关闭，依赖监控器对账: task={}", task_id);
                }
            }
        });

        Ok(handle)
    }

    async fn get_status(&self, handle: &ExecutionHandle) -> SyncResult<RuntimeJobStatus> {
        Ok(self
            .jobs
            .read()
            .await
            .entries
            .get(handle)
            .map(|entry| entry.status.clone())
            .unwrap_or(RuntimeJobStatus::Unknown))
    }

    async fn request_cancel(&self, handle: &ExecutionHandle) -> SyncResult<()> {
        let jobs = self.jobs.read().await;
        match jobs.entries.get(handle) {
            Some(entry) => {
                debug!("请求取消作业: task={}, handle={}", entry.task_id, handle);
                entry.cancellation.cancel();
                Ok(())
            }
            None => Err(SyncError::Dispatch(format!("未知的执行句柄: {handle}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_core::JobKind;
    use serde_json::json;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn run(&self, ctx: JobContext) -> SyncResult<Option<serde_json::Value>> {
            Ok(Some(ctx.payload.parameters))
        }
    }

    struct WaitForCancel;

    #[async_trait]
    impl JobHandler for WaitForCancel {
        async fn run(&self, ctx: JobContext) -> SyncResult<Option<serde_json::Value>> {
            ctx.cancellation.cancelled().await;
            Err(SyncError::Cancelled)
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _ctx: JobContext) -> SyncResult<Option<serde_json::Value>> {
            panic!("handler bug");
        }
    }

    fn payload() -> JobPayload {
        JobPayload {
            task_id: Uuid::new_v4(),
            job_kind: JobKind::new("crm", "contacts"),
            parameters: json!({"force_full": true}),
        }
    }

    #[tokio::test]
    async fn test_unregistered_reference_is_rejected() {
        let runtime = LocalJobRuntime::new();
        let result = runtime.submit(&JobReference::new("missing"), payload()).await;
        assert!(matches!(result, Err(SyncError::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_success_pushes_completion() {
        let (runtime, mut rx) = LocalJobRuntime::with_completions();
        runtime.register("echo", Arc::new(EchoHandler)).await;

        let payload = payload();
        let task_id = payload.task_id;
        let handle = runtime
            .submit(&JobReference::new("echo"), payload)
            .await
            .unwrap();

        let completion = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.task_id, task_id);
        assert_eq!(completion.handle, handle);
        assert!(completion.outcome.is_success());
        assert!(matches!(
            runtime.get_status(&handle).await.unwrap(),
            RuntimeJobStatus::Succeeded { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_reaches_handler() {
        let (runtime, mut rx) = LocalJobRuntime::with_completions();
        runtime.register("wait", Arc::new(WaitForCancel)).await;

        let handle = runtime
            .submit(&JobReference::new("wait"), payload())
            .await
            .unwrap();
        runtime.request_cancel(&handle).await.unwrap();

        let completion = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!completion.outcome.is_success());
        assert_eq!(
            runtime.get_status(&handle).await.unwrap(),
            RuntimeJobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_reports_failure() {
        let (runtime, mut rx) = LocalJobRuntime::with_completions();
        runtime.register("panics", Arc::new(Panics)).await;

        let handle = runtime
            .submit(&JobReference::new("panics"), payload())
            .await
            .unwrap();
        let completion = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!completion.outcome.is_success());
        assert!(matches!(
            runtime.get_status(&handle).await.unwrap(),
            RuntimeJobStatus::Failed { .. }
        ));
        assert_eq!(runtime.active_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_beyond_retention() {
        let runtime = LocalJobRuntime::new().with_finished_retention(3);
        runtime.register("echo", Arc::new(EchoHandler)).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let handle = runtime
                .submit(&JobReference::new("echo"), payload())
                .await
                .unwrap();
            handles.push(handle);
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while runtime.tracked_jobs().await > 3 || runtime.active_jobs().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(runtime.tracked_jobs().await, 3);
        let known = {
            let mut known = 0;
            for handle in &handles {
                if runtime.get_status(handle).await.unwrap() != RuntimeJobStatus::Unknown {
                    known += 1;
                }
            }
            known
        };
        assert_eq!(known, 3);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let runtime = LocalJobRuntime::new();
        let handle = ExecutionHandle::new("nope");
        assert_eq!(
            runtime.get_status(&handle).await.unwrap(),
            RuntimeJobStatus::Unknown
        );
        assert!(runtime.request_cancel(&handle).await.is_err());
    }
}
