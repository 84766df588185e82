use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datasync_core::{
    JobContext, JobHandler, ParameterValidator, PipelineConfig, SyncResult, SyncRunRepository,
    TaskControl,
};
use datasync_infrastructure::MetricsCollector;
use serde_json::{json, Value};
use tracing::debug;

use crate::pipeline::{JobControl, SyncPipeline, SyncRequest};
use crate::source::SourceFactory;

/// 把同步管道包装为运行时可执行的作业处理器
///
/// 所有作业引用都可以注册到同一个 `PipelineJob`，具体数据源按载荷中的作业类型选择。
pub struct PipelineJob {
    factory: Arc<dyn SourceFactory>,
    repository: Arc<dyn SyncRunRepository>,
    control: Option<Arc<dyn TaskControl>>,
    config: PipelineConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PipelineJob {
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        repository: Arc<dyn SyncRunRepository>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            factory,
            repository,
            control: None,
            config,
            metrics: None,
        }
    }

    /// 关联调度状态，用于心跳和取消标记
    pub fn with_task_control(mut self, control: Arc<dyn TaskControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 提交时校验 `force_full` / `manual_since` 参数，供作业注册表在准入阶段使用
    pub fn parameter_validator() -> ParameterValidator {
        Arc::new(|parameters: &Value| SyncRequest::from_parameters(parameters).map(|_| ()))
    }
}

#[async_trait]
impl JobHandler for PipelineJob {
    async fn run(&self, ctx: JobContext) -> SyncResult<Option<Value>> {
        let payload = ctx.payload;
        let request = SyncRequest::from_parameters(&payload.parameters)?;
        let components = self.factory.create(&payload.job_kind)?;
        debug!(
            "任务 {} 启动同步管道 {} (handle={})",
            payload.task_id, payload.job_kind, ctx.handle
        );

        let mut pipeline = SyncPipeline::new(
            payload.job_kind,
            components,
            self.repository.clone(),
            self.config.clone(),
        );
        if let Some(metrics) = &self.metrics {
            pipeline = pipeline.with_metrics(metrics.clone());
        }

        let mut control = JobControl::new(
            ctx.cancellation,
            Duration::from_secs(self.config.heartbeat_interval_seconds),
        );
        if let Some(task_control) = &self.control {
            control = control.with_task(payload.task_id, task_control.clone());
        }

        let run = pipeline.run(&request, &mut control).await?;
        Ok(Some(json!({
            "run_id": run.id,
            "status": run.status,
            "counts": run.counts,
            "strategy": run.configuration.get("strategy").cloned().unwrap_or(Value::Null),
        })))
    }
}
