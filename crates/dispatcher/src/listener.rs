use std::sync::Arc;

use datasync_core::{JobCompletion, SyncError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::WorkerPoolScheduler;

/// 完成事件监听器
///
/// 消费运行时推送的完成事件并交给调度器，槽位因此立即释放而不必等待下一次对账扫描。
pub struct CompletionListener {
    scheduler: Arc<WorkerPoolScheduler>,
}

impl CompletionListener {
    pub fn new(scheduler: Arc<WorkerPoolScheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn run(
        &self,
        mut completions: mpsc::UnboundedReceiver<JobCompletion>,
        shutdown: CancellationToken,
    ) {
        info!("完成事件监听器已启动");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("收到停止信号，退出完成事件监听");
                    break;
                }
                completion = completions.recv() => match completion {
                    Some(completion) => self.process_completion(completion).await,
                    None => {
                        warn!("完成事件通道已关闭");
                        break;
                    }
                }
            }
        }
    }

    async fn process_completion(&self, completion: JobCompletion) {
        debug!(
            "处理任务 {} 的完成事件 (handle={}, success={})",
            completion.task_id,
            completion.handle,
            completion.outcome.is_success()
        );

        match self
            .scheduler
            .complete(completion.task_id, completion.outcome)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("任务 {} 已处于终态，忽略完成事件", completion.task_id),
            Err(SyncError::TaskNotFound { id }) => {
                warn!("收到未知任务 {} 的完成事件，记录可能已过期", id)
            }
            Err(e) => error!("处理任务 {} 的完成事件时出错: {}", completion.task_id, e),
        }
    }
}
