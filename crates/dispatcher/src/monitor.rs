use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use datasync_core::{
    JobExecutionRuntime, MonitorConfig, RuntimeJobStatus, SyncResult, TaskOutcome, TaskRecord,
};
use datasync_infrastructure::{MetricsCollector, StructuredLogger};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::WorkerPoolScheduler;

/// 单次扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// 根据运行时真实状态补记结束的任务
    pub reconciled: usize,
    /// 心跳超时被标记失败的任务
    pub expired: usize,
    pub orphaned_slots: usize,
    /// 扫描末尾晋升的排队任务
    pub dispatched: usize,
}

impl SweepReport {
    pub fn transitions(&self) -> usize {
        self.reconciled + self.expired + self.orphaned_slots + self.dispatched
    }
}

/// 对账监控器
///
/// 周期性扫描运行中的任务：向运行时查询真实状态并补记遗漏的结束事件，
/// 把心跳超时的任务标记为失败以释放槽位，最后总是调用一次 `process_queue`。
/// 没有外部变化时连续两次扫描不会产生新的状态转换。
pub struct ReconciliationMonitor {
    scheduler: Arc<WorkerPoolScheduler>,
    runtime: Arc<dyn JobExecutionRuntime>,
    config: MonitorConfig,
    metrics: Arc<MetricsCollector>,
    running: Arc<RwLock<bool>>,
}

impl ReconciliationMonitor {
    pub fn new(
        scheduler: Arc<WorkerPoolScheduler>,
        runtime: Arc<dyn JobExecutionRuntime>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            scheduler,
            runtime,
            config,
            metrics: Arc::new(MetricsCollector::new()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 检查任务心跳是否超时
    fn is_task_stale(&self, task: &TaskRecord, now: DateTime<Utc>) -> bool {
        if !task.is_running() {
            return false;
        }
        task.heartbeat_age(now)
            .is_some_and(|age| age.num_seconds() > self.config.stale_threshold_seconds)
    }

    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// 以给定时间执行一次扫描
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SyncResult<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport {
            orphaned_slots: self.scheduler.release_orphaned_slots().await?,
            ..Default::default()
        };

        for task in self.scheduler.list_active().await? {
            if self.reconcile_with_runtime(&task).await {
                report.reconciled += 1;
                continue;
            }

            if self.is_task_stale(&task, now) {
                let stale_before =
                    now - chrono::Duration::seconds(self.config.stale_threshold_seconds);
                match self.scheduler.expire(task.id, stale_before).await {
                    Ok(true) => report.expired += 1,
                    Ok(false) => debug!("任务 {} 在扫描期间已更新，跳过过期处理", task.id),
                    Err(e) => error!("标记任务 {} 过期时出错: {}", task.id, e),
                }
            }
        }

        report.dispatched = self.scheduler.process_queue().await?;

        if let Err(e) = self.scheduler.stats().await {
            warn!("刷新调度指标失败: {}", e);
        }
        let elapsed = started.elapsed();
        self.metrics.record_sweep_duration(elapsed.as_secs_f64());
        StructuredLogger::log_sweep_completed(
            report.reconciled,
            report.expired,
            report.dispatched,
            elapsed.as_millis() as u64,
        );
        Ok(report)
    }

    /// 把运行时已结束但未上报的任务补记为结束，返回是否发生转换
    async fn reconcile_with_runtime(&self, task: &TaskRecord) -> bool {
        let Some(handle) = &task.execution_handle else {
            return false;
        };

        let outcome = match self.runtime.get_status(handle).await {
            Ok(RuntimeJobStatus::Succeeded { result }) => TaskOutcome::Succeeded { result },
            Ok(RuntimeJobStatus::Failed { error }) => TaskOutcome::Failed { error },
            Ok(RuntimeJobStatus::Cancelled) => TaskOutcome::failed("作业已被运行时取消"),
            // Unknown 交给心跳超时处理
            Ok(_) => return false,
            Err(e) => {
                warn!("查询任务 {} 的运行时状态失败: {}", task.id, e);
                return false;
            }
        };

        match self.scheduler.complete(task.id, outcome).await {
            Ok(applied) => {
                if applied {
                    info!("补记任务 {} 的结束状态", task.id);
                }
                applied
            }
            Err(e) => {
                error!("补记任务 {} 的结束状态失败: {}", task.id, e);
                false
            }
        }
    }

    /// 启动扫描循环，直到 `shutdown` 触发或调用 [`stop`](Self::stop)
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("对账监控器已禁用");
            return;
        }

        *self.running.write().await = true;
        info!(
            "启动对账监控循环，间隔 {} 秒，心跳超时 {} 秒",
            self.config.sweep_interval_seconds, self.config.stale_threshold_seconds
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("收到停止信号，退出对账监控循环");
                    break;
                }
                _ = interval.tick() => {
                    if !*self.running.read().await {
                        info!("对账监控器已停止");
                        break;
                    }

                    // 多实例部署时错开扫描时间
                    if self.config.jitter_millis > 0 {
                        let jitter = rand::rng().random_range(0..=self.config.jitter_millis);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }

                    if let Err(e) = self.sweep().await {
                        error!("对账扫描出错: {}", e);
                    }
                }
            }
        }

        *self.running.write().await = false;
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("对账监控器停止信号已发送");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobRegistry;
    use crate::test_utils::ScriptedRuntime;
    use datasync_core::{JobKind, SchedulerConfig};
    use datasync_infrastructure::InMemoryQueueStore;
    use serde_json::json;

    fn setup() -> (Arc<WorkerPoolScheduler>, Arc<ScriptedRuntime>, ReconciliationMonitor) {
        let runtime = Arc::new(ScriptedRuntime::new());
        let scheduler = Arc::new(WorkerPoolScheduler::new(
            Arc::new(InMemoryQueueStore::new()),
            JobRegistry::new(),
            runtime.clone(),
            &SchedulerConfig {
                max_workers: 1,
                ..Default::default()
            },
        ));
        let monitor = ReconciliationMonitor::new(
            scheduler.clone(),
            runtime.clone(),
            MonitorConfig {
                stale_threshold_seconds: 60,
                jitter_millis: 0,
                ..Default::default()
            },
        );
        (scheduler, runtime, monitor)
    }

    #[tokio::test]
    async fn test_stale_detection_boundary() {
        let (scheduler, _, monitor) = setup();
        let id = scheduler
            .submit(JobKind::new("crm", "contacts"), json!({}), 0)
            .await
            .unwrap();
        let task = scheduler.get_status(id).await.unwrap();
        let heartbeat = task.last_heartbeat.unwrap();

        assert!(!monitor.is_task_stale(&task, heartbeat + chrono::Duration::seconds(60)));
        assert!(monitor.is_task_stale(&task, heartbeat + chrono::Duration::seconds(61)));
    }

    #[tokio::test]
    async fn test_runtime_cancelled_is_failed() {
        let (scheduler, runtime, monitor) = setup();
        let id = scheduler
            .submit(JobKind::new("crm", "contacts"), json!({}), 0)
            .await
            .unwrap();
        runtime.set_task_status(id, RuntimeJobStatus::Cancelled);

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.reconciled, 1);
        let task = scheduler.get_status(id).await.unwrap();
        assert_eq!(task.status, datasync_core::TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_status_left_to_heartbeat() {
        let (scheduler, runtime, monitor) = setup();
        let id = scheduler
            .submit(JobKind::new("crm", "contacts"), json!({}), 0)
            .await
            .unwrap();
        runtime.set_task_status(id, RuntimeJobStatus::Unknown);

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(scheduler.get_status(id).await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let (_, _, monitor) = setup();
        let monitor = Arc::new(monitor);
        let shutdown = CancellationToken::new();

        let handle = {
            let monitor = monitor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_running().await);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!monitor.is_running().await);
    }
}
