use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use datasync_core::{
    JobKind, PipelineConfig, SyncCounts, SyncError, SyncResult, SyncRunRecord, SyncRunRepository,
    TaskControl,
};
use datasync_infrastructure::{MetricsCollector, StructuredLogger};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::saver::RecordError;
use crate::source::PipelineComponents;
use crate::strategy::{determine_strategy, SyncStrategy};

/// 单次运行的阶段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    #[default]
    Initialized,
    Fetching,
    Transforming,
    Validating,
    Saving,
    Success,
    Partial,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Initialized => "initialized",
            PipelineStage::Fetching => "fetching",
            PipelineStage::Transforming => "transforming",
            PipelineStage::Validating => "validating",
            PipelineStage::Saving => "saving",
            PipelineStage::Success => "success",
            PipelineStage::Partial => "partial",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 运行参数，来自任务提交时的 `parameters`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    pub force_full: bool,
    #[serde(alias = "since")]
    pub manual_since: Option<DateTime<Utc>>,
}

impl SyncRequest {
    pub fn from_parameters(parameters: &Value) -> SyncResult<Self> {
        if parameters.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(parameters.clone())
            .map_err(|e| SyncError::Validation(format!("无效的同步参数: {e}")))
    }
}

/// 作业侧的协作式控制
///
/// 每个批次边界调用一次 `checkpoint`：检查取消令牌和共享状态中的取消标记。
/// 心跳由 [`JobControl::start_heartbeat`] 启动的后台任务按固定间隔刷新，
/// 不受单个批次耗时的影响。
pub struct JobControl {
    cancellation: CancellationToken,
    task: Option<(Uuid, Arc<dyn TaskControl>)>,
    heartbeat_interval: Duration,
}

impl JobControl {
    pub fn new(cancellation: CancellationToken, heartbeat_interval: Duration) -> Self {
        Self {
            cancellation,
            task: None,
            heartbeat_interval,
        }
    }

    /// 不关联调度任务的控制，只响应取消令牌
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), Duration::from_secs(15))
    }

    pub fn with_task(mut self, task_id: Uuid, control: Arc<dyn TaskControl>) -> Self {
        self.task = Some((task_id, control));
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub async fn checkpoint(&mut self) -> SyncResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let Some((task_id, control)) = &self.task else {
            return Ok(());
        };

        match control.is_cancel_requested(*task_id).await {
            Ok(true) => {
                self.cancellation.cancel();
                Err(SyncError::Cancelled)
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("查询任务 {} 的取消标记失败: {}", task_id, e);
                Ok(())
            }
        }
    }

    /// 启动后台心跳，返回的守卫被丢弃时停止
    ///
    /// 第一次心跳在一个间隔之后发送；未关联调度任务或间隔为零时不启动。
    pub fn start_heartbeat(&self) -> Option<DropGuard> {
        let (task_id, control) = self.task.clone()?;
        if self.heartbeat_interval.is_zero() {
            return None;
        }

        let stop = self.cancellation.child_token();
        let stopped = stop.clone();
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = control.heartbeat(task_id).await {
                            warn!("任务 {} 心跳刷新失败: {}", task_id, e);
                        }
                    }
                }
            }
            debug!("任务 {} 的心跳已停止", task_id);
        });
        Some(stop.drop_guard())
    }
}

#[derive(Debug, Default)]
struct Progress {
    counts: SyncCounts,
    batches: i64,
    stage: PipelineStage,
}

impl Progress {
    fn enter(&mut self, stage: PipelineStage) {
        self.stage = stage;
    }
}

/// 通用同步管道
///
/// 阶段：Initialized -> Fetching -> Transforming -> Validating -> Saving -> {Success, Partial, Failed}。
/// 单条记录的校验和保存失败只计数；数据源错误或取消使整次运行失败，
/// 运行记录以 Failed 结束后把错误返回给调用方。
pub struct SyncPipeline {
    job_kind: JobKind,
    components: PipelineComponents,
    repository: Arc<dyn SyncRunRepository>,
    config: PipelineConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl SyncPipeline {
    pub fn new(
        job_kind: JobKind,
        components: PipelineComponents,
        repository: Arc<dyn SyncRunRepository>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            job_kind,
            components,
            repository,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn job_kind(&self) -> &JobKind {
        &self.job_kind
    }

    /// 执行一次同步
    ///
    /// 无论在哪一步失败，数据源都会在返回前关闭。
    pub async fn run(
        &self,
        request: &SyncRequest,
        control: &mut JobControl,
    ) -> SyncResult<SyncRunRecord> {
        let _heartbeat = control.start_heartbeat();
        let result = self.execute(request, control).await;

        if let Err(e) = self.components.source.close().await {
            warn!("关闭数据源 {} 失败: {}", self.job_kind, e);
        }
        result
    }

    async fn execute(
        &self,
        request: &SyncRequest,
        control: &mut JobControl,
    ) -> SyncResult<SyncRunRecord> {
        let started = Instant::now();
        let strategy = determine_strategy(
            self.repository.as_ref(),
            &self.job_kind.source_system,
            &self.job_kind.operation,
            request.force_full,
            request.manual_since,
        )
        .await?;

        let configuration = json!({
            "strategy": strategy.name(),
            "since": strategy.since(),
            "force_full": request.force_full,
            "manual_since": request.manual_since,
            "batch_size": self.config.batch_size,
        });
        let mut run = self
            .repository
            .create(&SyncRunRecord::start(
                &self.job_kind.source_system,
                &self.job_kind.operation,
                configuration,
            ))
            .await?;
        info!("同步运行 {} 开始: {} 策略 {}", run.id, self.job_kind, strategy);

        let mut progress = Progress::default();
        let result = self.stream_batches(strategy, control, &mut progress).await;

        let now = Utc::now();
        match &result {
            Ok(()) => run.finish(progress.counts, progress.batches, now)?,
            Err(SyncError::Cancelled) => run.fail(progress.counts, "cancelled", now)?,
            Err(e) => {
                error!(
                    "同步运行 {} 在 {} 阶段失败: {}",
                    run.id, progress.stage, e
                );
                run.fail(progress.counts, e.to_string(), now)?
            }
        }

        if let Err(persist) = self.repository.finish(&run).await {
            error!("保存同步运行 {} 的结束状态失败: {}", run.id, persist);
            if result.is_ok() {
                return Err(persist);
            }
        }

        StructuredLogger::log_sync_run_completed(&run);
        if let Some(metrics) = &self.metrics {
            metrics.record_pipeline_run(
                run.counts.processed,
                run.counts.failed,
                started.elapsed().as_secs_f64(),
            );
        }

        result.map(|()| run)
    }

    async fn stream_batches(
        &self,
        strategy: SyncStrategy,
        control: &mut JobControl,
        progress: &mut Progress,
    ) -> SyncResult<()> {
        let source = self.components.source.as_ref();
        source.authenticate().await.map_err(into_source_error)?;
        control.checkpoint().await?;

        progress.enter(PipelineStage::Fetching);
        let batch_size = self.config.batch_size;
        let mut batches = source.fetch(strategy.since(), batch_size);

        while let Some(batch) = batches.next().await {
            let batch = batch.map_err(into_source_error)?;
            for (chunk_no, chunk) in batch.chunks(batch_size).enumerate() {
                let offset = chunk_no * batch_size;
                for e in self.process_chunk(chunk, progress).await {
                    debug!(
                        "{} 第 {} 批第 {} 条记录失败: {}",
                        self.job_kind,
                        progress.batches,
                        offset + e.index,
                        e.message
                    );
                }
            }
            progress.enter(PipelineStage::Fetching);
            control.checkpoint().await?;
        }

        progress.enter(if progress.counts.failed == 0 {
            PipelineStage::Success
        } else {
            PipelineStage::Partial
        });
        Ok(())
    }

    /// 处理一块记录，返回按块内原始下标排序的失败记录
    async fn process_chunk(&self, chunk: &[Value], progress: &mut Progress) -> Vec<RecordError> {
        let mapper = self.components.mapper.as_ref();

        progress.enter(PipelineStage::Transforming);
        let mapped: Vec<Value> = chunk.iter().map(|raw| mapper.transform(raw)).collect();

        progress.enter(PipelineStage::Validating);
        let mut valid = Vec::with_capacity(mapped.len());
        let mut positions = Vec::with_capacity(mapped.len());
        let mut errors = Vec::new();
        for (index, record) in mapped.into_iter().enumerate() {
            match mapper.validate(record) {
                Ok(record) => {
                    valid.push(record);
                    positions.push(index);
                }
                Err(e) => errors.push(RecordError {
                    index,
                    message: e.to_string(),
                }),
            }
        }
        let rejected = errors.len() as i64;

        progress.enter(PipelineStage::Saving);
        let mut report = self.components.saver.save(&valid).await;
        report.remap_indices(&positions);

        let mut counts = report.counts();
        counts.processed += rejected;
        counts.failed += rejected;
        progress.counts.merge(&counts);
        progress.batches += 1;

        errors.append(&mut report.errors);
        errors.sort_by_key(|e| e.index);
        errors
    }
}

fn into_source_error(e: SyncError) -> SyncError {
    match e {
        SyncError::Source(_) | SyncError::Cancelled => e,
        other => SyncError::Source(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::FieldMapper;
    use crate::test_utils::{FlakySink, ScriptedSource};
    use datasync_infrastructure::InMemorySyncRunRepository;

    #[tokio::test]
    async fn test_chunk_errors_point_at_original_records() {
        let mapper = Arc::new(
            FieldMapper::default()
                .field("id", "id", true)
                .field("poison", "poison", false),
        );
        let pipeline = SyncPipeline::new(
            JobKind::new("crm", "contacts"),
            ScriptedSource::new().components(mapper, Arc::new(FlakySink::new())),
            Arc::new(InMemorySyncRunRepository::new()),
            PipelineConfig::default(),
        );
        let chunk = vec![
            json!({ "name": "no id" }),
            json!({ "id": 1 }),
            json!({ "id": 2, "poison": true }),
            json!({ "id": 3 }),
        ];

        let mut progress = Progress::default();
        let errors = pipeline.process_chunk(&chunk, &mut progress).await;

        let indices: Vec<usize> = errors.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(progress.counts.processed, 4);
        assert_eq!(progress.counts.failed, 2);
        assert_eq!(progress.counts.created, 2);
    }
}
