use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datasync_core::{
    ExecutionHandle, JobExecutionRuntime, JobKind, JobPayload, PersistentQueueStore,
    SchedulerConfig, SyncError, SyncResult, TaskControl, TaskOutcome, TaskRecord, TaskStatus,
};
use datasync_infrastructure::{InMemoryQueueStore, MetricsCollector, StructuredLogger};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::registry::JobRegistry;
use crate::state::{Counter, SchedulerCounters, SchedulerStateStore};

/// 保存执行句柄的尝试次数
const HANDLE_ATTACH_ATTEMPTS: u32 = 3;
const HANDLE_ATTACH_BACKOFF: Duration = Duration::from_millis(20);

/// 调度器状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub max_workers: usize,
    pub running: usize,
    pub queued: usize,
    pub counters: SchedulerCounters,
    /// 本地降级视图中仍有任务
    pub degraded: bool,
}

/// 工作池调度器
///
/// 负责准入控制、优先级排队和分发。槽位计数以共享存储中的活跃集合为准，
/// 多个实例并发调用时只保证软上限；单进程内活跃集合的原子更新保证不会超发。
///
/// 共享存储不可达时，调度器对本次调用降级到进程内视图并记录告警，
/// 后续读操作会合并两个视图的内容。
pub struct WorkerPoolScheduler {
    primary: SchedulerStateStore,
    fallback: SchedulerStateStore,
    registry: JobRegistry,
    runtime: Arc<dyn JobExecutionRuntime>,
    max_workers: AtomicUsize,
    instance_id: String,
    metrics: Arc<MetricsCollector>,
}

impl WorkerPoolScheduler {
    pub fn new(
        store: Arc<dyn PersistentQueueStore>,
        registry: JobRegistry,
        runtime: Arc<dyn JobExecutionRuntime>,
        config: &SchedulerConfig,
    ) -> Self {
        let ttl = Duration::from_secs(config.terminal_record_ttl_seconds);
        Self {
            primary: SchedulerStateStore::new(store, config.key_prefix.clone(), ttl),
            fallback: SchedulerStateStore::new(
                Arc::new(InMemoryQueueStore::new()),
                config.key_prefix.clone(),
                ttl,
            ),
            registry,
            runtime,
            max_workers: AtomicUsize::new(config.max_workers),
            instance_id: config.instance_id.clone(),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        metrics.update_max_workers(self.max_workers());
        self.metrics = metrics;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 检查共享存储是否可达
    pub async fn check_store(&self) -> SyncResult<()> {
        self.primary.health_check().await
    }

    fn views(&self) -> [&SchedulerStateStore; 2] {
        [&self.primary, &self.fallback]
    }

    fn degrade(&self, operation: &str, error: &SyncError) {
        StructuredLogger::log_store_degraded(operation, &error.to_string());
        self.metrics.record_store_degraded();
    }

    /// 找到持有该任务的视图
    async fn locate(&self, task_id: Uuid) -> SyncResult<(&SchedulerStateStore, TaskRecord)> {
        let mut unavailable = None;
        for view in self.views() {
            match view.load_task(task_id).await {
                Ok(Some(record)) => return Ok((view, record)),
                Ok(None) => continue,
                Err(e) if e.is_store_unavailable() => {
                    self.degrade("load_task", &e);
                    unavailable = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(unavailable.unwrap_or(SyncError::TaskNotFound { id: task_id }))
    }

    /// 提交作业
    ///
    /// 作业类型无法解析或参数不合法时返回 `SyncError::Admission`，不会创建任务记录。
    /// 有空闲槽位且队列为空时立即分发，否则进入优先级队列；不会等待槽位。
    #[instrument(skip(self, parameters), fields(job = %job_kind))]
    pub async fn submit(
        &self,
        job_kind: JobKind,
        parameters: serde_json::Value,
        priority: i32,
    ) -> SyncResult<Uuid> {
        self.registry.admit(&job_kind, &parameters)?;

        let record = TaskRecord::new(job_kind, parameters, priority);

        // submit_on 出错时运行时尚未接收该任务，整体改在本地视图上重试不会重复执行
        let queued = match self.submit_on(&self.primary, &record).await {
            Ok(queued) => queued,
            Err(e) if e.is_store_unavailable() => {
                self.degrade("submit", &e);
                self.discard(&self.primary, record.id).await;
                self.submit_on(&self.fallback, &record).await?
            }
            Err(e) => return Err(e),
        };

        self.metrics.record_task_submitted();
        StructuredLogger::log_task_submitted(record.id, &record.job_kind, priority, queued);
        Ok(record.id)
    }

    /// 在一个视图上完成准入
    ///
    /// 只有作业交给运行时之前的步骤失败才返回错误；之后的记账以及入队后的晋升都是尽力而为。
    async fn submit_on(&self, state: &SchedulerStateStore, record: &TaskRecord) -> SyncResult<bool> {
        state.save_task(record).await?;

        if state.queue_len().await? == 0
            && state
                .try_acquire_slot(record.id, Utc::now(), self.max_workers())
                .await?
        {
            self.dispatch(state, record.id).await?;
            self.count(state, Counter::Submitted).await;
            return Ok(false);
        }

        state.enqueue(record).await?;
        self.count(state, Counter::Submitted).await;
        if let Err(e) = self.process_queue_on(state).await {
            warn!("任务 {} 已入队，立即晋升失败，等待下一次队列处理: {}", record.id, e);
        }
        Ok(true)
    }

    /// 清理准入失败后留在某个视图中的残留状态
    async fn discard(&self, state: &SchedulerStateStore, task_id: Uuid) {
        let cleanup = async {
            state.remove_queued(task_id).await?;
            state.release_slot(task_id).await?;
            state.delete_task(task_id).await
        };
        if let Err(e) = cleanup.await {
            debug!("清理任务 {} 在共享存储中的残留状态失败: {}", task_id, e);
        }
    }

    async fn count(&self, state: &SchedulerStateStore, counter: Counter) {
        if let Err(e) = state.bump(counter).await {
            warn!("更新调度统计 {:?} 失败: {}", counter, e);
        }
    }

    /// 晋升为运行状态并提交给执行运行时，调用前必须已经占用槽位
    ///
    /// 返回错误时运行时一定没有接收该任务。
    async fn dispatch(&self, state: &SchedulerStateStore, task_id: Uuid) -> SyncResult<()> {
        let now = Utc::now();
        let (record, applied) = state
            .update_task(task_id, |r| r.start(now).is_ok())
            .await?;
        if !applied {
            debug!("任务 {} 已不在排队状态({})，放弃分发", task_id, record.status);
            state.release_slot(task_id).await?;
            return Ok(());
        }

        let job_ref = match self
            .registry
            .resolve(&record.job_kind.source_system, &record.job_kind.operation)
        {
            Ok(job_ref) => job_ref,
            Err(e) => return self.reject_dispatch(state, task_id, "-", e).await,
        };

        let payload = JobPayload {
            task_id,
            job_kind: record.job_kind.clone(),
            parameters: record.parameters.clone(),
        };

        match self.runtime.submit(&job_ref, payload).await {
            Ok(handle) => {
                self.attach_handle(state, task_id, job_ref.as_str(), &handle)
                    .await;
                Ok(())
            }
            Err(e) => self.reject_dispatch(state, task_id, job_ref.as_str(), e).await,
        }
    }

    /// 保存执行句柄，重试用尽后撤销这次执行
    async fn attach_handle(
        &self,
        state: &SchedulerStateStore,
        task_id: Uuid,
        job_ref: &str,
        handle: &ExecutionHandle,
    ) {
        let mut last_error = None;
        for attempt in 1..=HANDLE_ATTACH_ATTEMPTS {
            let attached = state
                .update_task(task_id, |r| {
                    if r.is_running() && r.execution_handle.is_none() {
                        r.execution_handle = Some(handle.clone());
                        true
                    } else {
                        false
                    }
                })
                .await;
            match attached {
                Ok((record, applied)) => {
                    if !applied && record.status == TaskStatus::Cancelled {
                        // 取消发生在句柄写入之前，运行时还没有收到通知
                        if let Err(e) = self.runtime.request_cancel(handle).await {
                            warn!("通知运行时取消任务 {} 失败: {}", task_id, e);
                        }
                    }
                    self.count(state, Counter::Dispatched).await;
                    self.metrics.record_task_dispatched();
                    StructuredLogger::log_task_dispatched(task_id, job_ref, handle.as_str());
                    return;
                }
                Err(e) => {
                    warn!(
                        "保存任务 {} 的执行句柄失败(第 {}/{} 次): {}",
                        task_id, attempt, HANDLE_ATTACH_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    if attempt < HANDLE_ATTACH_ATTEMPTS {
                        tokio::time::sleep(HANDLE_ATTACH_BACKOFF * attempt).await;
                    }
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        self.abandon_dispatch(state, task_id, handle, &cause).await;
    }

    /// 没有句柄的运行中任务既无法取消也无法对账：取消执行、任务失败、归还槽位
    async fn abandon_dispatch(
        &self,
        state: &SchedulerStateStore,
        task_id: Uuid,
        handle: &ExecutionHandle,
        cause: &str,
    ) {
        let message = format!("无法保存执行句柄，已撤销执行: {cause}");
        error!(task.id = %task_id, handle = %handle, "{}", message);

        if let Err(e) = self.runtime.request_cancel(handle).await {
            warn!("通知运行时取消任务 {} 失败: {}", task_id, e);
        }

        let now = Utc::now();
        match state
            .update_task(task_id, |r| r.fail(now, message.clone()).is_ok())
            .await
        {
            Ok((_, true)) => {
                self.count(state, Counter::Failed).await;
                self.metrics.record_task_failed();
            }
            Ok((record, false)) => {
                debug!("任务 {} 已处于 {}，不再标记失败", task_id, record.status);
            }
            Err(e) => warn!("任务 {} 标记失败时出错，等待心跳超时处理: {}", task_id, e),
        }
        if let Err(e) = state.release_slot(task_id).await {
            warn!("归还任务 {} 的槽位失败，等待孤立槽位回收: {}", task_id, e);
        }
    }

    /// 运行时同步拒绝：任务直接失败，槽位归还
    async fn reject_dispatch(
        &self,
        state: &SchedulerStateStore,
        task_id: Uuid,
        job_ref: &str,
        cause: SyncError,
    ) -> SyncResult<()> {
        let message = if matches!(cause, SyncError::Dispatch(_)) {
            cause.to_string()
        } else {
            SyncError::Dispatch(cause.to_string()).to_string()
        };
        let now = Utc::now();
        state
            .update_task(task_id, |r| r.fail(now, message.clone()).is_ok())
            .await?;
        state.release_slot(task_id).await?;
        self.count(state, Counter::DispatchErrors).await;
        self.count(state, Counter::Failed).await;

        self.metrics.record_dispatch_error();
        StructuredLogger::log_dispatch_rejected(task_id, job_ref, &message);
        Ok(())
    }

    /// 查询任务记录
    pub async fn get_status(&self, task_id: Uuid) -> SyncResult<TaskRecord> {
        self.locate(task_id).await.map(|(_, record)| record)
    }

    /// 占用槽位的任务，按开始时间排序
    pub async fn list_active(&self) -> SyncResult<Vec<TaskRecord>> {
        let mut active = Vec::new();
        for view in self.views() {
            match self.active_records(view).await {
                Ok(records) => active.extend(records),
                Err(e) if e.is_store_unavailable() => self.degrade("list_active", &e),
                Err(e) => return Err(e),
            }
        }
        active.retain(|r| r.is_running());
        active.sort_by_key(|r| (r.started_at, r.queued_at));
        Ok(active)
    }

    async fn active_records(&self, state: &SchedulerStateStore) -> SyncResult<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for task_id in state.active_ids().await? {
            if let Some(record) = state.load_task(task_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// 排队中的任务，按出队顺序
    pub async fn list_queued(&self) -> SyncResult<Vec<TaskRecord>> {
        let mut queued = Vec::new();
        for view in self.views() {
            let entries = match view.queued_entries().await {
                Ok(entries) => entries,
                Err(e) if e.is_store_unavailable() => {
                    self.degrade("list_queued", &e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for entry in entries {
                if let Some(record) = view.load_task(entry.task_id).await? {
                    if record.status == TaskStatus::Queued {
                        queued.push((entry, record));
                    }
                }
            }
        }
        queued.sort_by_key(|(entry, _)| {
            (std::cmp::Reverse(entry.priority), entry.queued_at, entry.seq)
        });
        Ok(queued.into_iter().map(|(_, record)| record).collect())
    }

    /// 取消任务
    ///
    /// 排队中的任务直接出队；运行中的任务写入取消标记并尽力通知运行时，
    /// 管道在下一个批次边界观察到取消。已处于终态时返回 `false`。
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: Uuid) -> SyncResult<bool> {
        let (state, _) = self.locate(task_id).await?;

        let previous: Mutex<Option<TaskStatus>> = Mutex::new(None);
        let now = Utc::now();
        let (record, applied) = state
            .update_task(task_id, |r| {
                if let Ok(mut slot) = previous.lock() {
                    *slot = Some(r.status);
                }
                r.cancel(now).is_ok()
            })
            .await?;

        if !applied {
            debug!("任务 {} 已处于终态 {}，忽略取消", task_id, record.status);
            return Ok(false);
        }
        let previous = previous
            .into_inner()
            .ok()
            .flatten()
            .unwrap_or(TaskStatus::Queued);

        self.count(state, Counter::Cancelled).await;
        self.metrics.record_task_cancelled();
        StructuredLogger::log_task_cancelled(task_id, previous);

        match previous {
            TaskStatus::Queued => {
                state.remove_queued(task_id).await?;
            }
            _ => {
                state.set_cancel_flag(task_id).await?;
                if let Some(handle) = &record.execution_handle {
                    if let Err(e) = self.runtime.request_cancel(handle).await {
                        warn!("通知运行时取消任务 {} 失败: {}", task_id, e);
                    }
                }
                state.release_slot(task_id).await?;
                self.backfill().await;
            }
        }
        Ok(true)
    }

    /// 按优先级晋升排队任务直到槽位用尽，返回本次晋升的任务数
    pub async fn process_queue(&self) -> SyncResult<usize> {
        let mut promoted = 0;
        for view in self.views() {
            match self.process_queue_on(view).await {
                Ok(n) => promoted += n,
                Err(e) if e.is_store_unavailable() => self.degrade("process_queue", &e),
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }

    async fn process_queue_on(&self, state: &SchedulerStateStore) -> SyncResult<usize> {
        let mut promoted = 0;
        loop {
            let max_workers = self.max_workers();
            if state.active_count().await? >= max_workers {
                break;
            }
            let Some(entry) = state.pop_next().await? else {
                break;
            };

            match state.load_task(entry.task_id).await? {
                Some(record) if record.status == TaskStatus::Queued => {}
                _ => {
                    debug!("丢弃失效的队列条目: {}", entry.task_id);
                    continue;
                }
            }

            if !state
                .try_acquire_slot(entry.task_id, Utc::now(), max_workers)
                .await?
            {
                // 槽位被其他实例抢占
                state.requeue(entry).await?;
                break;
            }

            if let Err(e) = self.dispatch(state, entry.task_id).await {
                let task_id = entry.task_id;
                let restore = async {
                    state.release_slot(task_id).await?;
                    state.requeue(entry).await
                };
                if let Err(restore_error) = restore.await {
                    warn!("任务 {} 分发失败后放回队列失败: {}", task_id, restore_error);
                }
                return Err(e);
            }
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn backfill(&self) {
        if let Err(e) = self.process_queue().await {
            error!("槽位释放后晋升排队任务失败: {}", e);
        }
    }

    /// 运行时调整并发上限；缩小不会抢占运行中的任务
    pub async fn reconfigure(&self, max_workers: usize) -> SyncResult<usize> {
        if max_workers == 0 {
            return Err(SyncError::Configuration(
                "max_workers必须大于0".to_string(),
            ));
        }
        let previous = self.max_workers.swap(max_workers, Ordering::SeqCst);
        self.metrics.update_max_workers(max_workers);
        info!(
            scheduler.instance = %self.instance_id,
            "调整并发上限: {} -> {}", previous, max_workers
        );

        if max_workers > previous {
            self.process_queue().await?;
        }
        Ok(previous)
    }

    /// 应用运行时报告的结束结果，任务不在运行状态时忽略并返回 `false`
    #[instrument(skip(self, outcome))]
    pub async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> SyncResult<bool> {
        let (state, _) = self.locate(task_id).await?;
        let now = Utc::now();
        let (record, applied) = state
            .update_task(task_id, |r| match &outcome {
                TaskOutcome::Succeeded { .. } => r.complete(now).is_ok(),
                TaskOutcome::Failed { error } => r.fail(now, error.clone()).is_ok(),
            })
            .await?;

        if !applied {
            debug!("任务 {} 当前状态为 {}，忽略完成事件", task_id, record.status);
            return Ok(false);
        }

        if let TaskOutcome::Succeeded { result: Some(result) } = &outcome {
            debug!("任务 {} 结果: {}", task_id, result);
        }

        let counter = if outcome.is_success() {
            self.metrics.record_task_completed();
            Counter::Completed
        } else {
            self.metrics.record_task_failed();
            Counter::Failed
        };
        self.release_finished(state, &record, counter).await?;
        Ok(true)
    }

    /// 心跳超时处理：仅当最近心跳早于 `stale_before` 时标记失败
    pub async fn expire(&self, task_id: Uuid, stale_before: DateTime<Utc>) -> SyncResult<bool> {
        let (state, _) = self.locate(task_id).await?;
        let now = Utc::now();
        let last_seen: Mutex<Option<DateTime<Utc>>> = Mutex::new(None);
        let (record, applied) = state
            .update_task(task_id, |r| {
                if !r.is_running() {
                    return false;
                }
                let Some(last) = r.last_heartbeat.or(r.started_at) else {
                    return false;
                };
                if last >= stale_before {
                    return false;
                }
                if let Ok(mut slot) = last_seen.lock() {
                    *slot = Some(last);
                }
                let error = SyncError::StaleTask {
                    task_id: r.id,
                    last_heartbeat: last,
                };
                r.fail(now, error.to_string()).is_ok()
            })
            .await?;

        if !applied {
            return Ok(false);
        }

        if let Some(last) = last_seen.into_inner().ok().flatten() {
            StructuredLogger::log_stale_task(task_id, last, (now - stale_before).num_seconds());
        }
        self.count(state, Counter::Stale).await;
        self.metrics.record_task_stale();
        self.release_finished(state, &record, Counter::Failed).await?;
        Ok(true)
    }

    async fn release_finished(
        &self,
        state: &SchedulerStateStore,
        record: &TaskRecord,
        counter: Counter,
    ) -> SyncResult<()> {
        state.release_slot(record.id).await?;
        self.count(state, counter).await;
        StructuredLogger::log_task_finished(
            record.id,
            record.status,
            record.started_at,
            record.error.as_deref(),
        );
        self.backfill().await;
        Ok(())
    }

    /// 刷新运行中任务的心跳
    pub async fn heartbeat(&self, task_id: Uuid) -> SyncResult<bool> {
        let (state, _) = self.locate(task_id).await?;
        let now = Utc::now();
        let (_, applied) = state
            .update_task(task_id, |r| r.record_heartbeat(now))
            .await?;
        Ok(applied)
    }

    /// 释放记录已结束或已丢失的槽位，返回释放数量
    ///
    /// 进程在写入终态与释放槽位之间崩溃时会留下这类槽位。
    pub async fn release_orphaned_slots(&self) -> SyncResult<usize> {
        let mut released = 0;
        for view in self.views() {
            let ids = match view.active_ids().await {
                Ok(ids) => ids,
                Err(e) if e.is_store_unavailable() => {
                    self.degrade("release_orphaned_slots", &e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for task_id in ids {
                let orphaned = match view.load_task(task_id).await? {
                    Some(record) => record.is_terminal(),
                    None => true,
                };
                if orphaned && view.release_slot(task_id).await? {
                    warn!("释放孤立槽位: task={}", task_id);
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    pub async fn stats(&self) -> SyncResult<SchedulerStats> {
        let mut counters = SchedulerCounters::default();
        for view in self.views() {
            match view.counters().await {
                Ok(c) => counters.merge(&c),
                Err(e) if e.is_store_unavailable() => self.degrade("stats", &e),
                Err(e) => return Err(e),
            }
        }

        let running = self.list_active().await?.len();
        let queued = self.list_queued().await?.len();
        let degraded =
            self.fallback.active_count().await? + self.fallback.queue_len().await? > 0;

        self.metrics.update_pool(running, queued);

        Ok(SchedulerStats {
            max_workers: self.max_workers(),
            running,
            queued,
            counters,
            degraded,
        })
    }
}

#[async_trait]
impl TaskControl for WorkerPoolScheduler {
    async fn heartbeat(&self, task_id: Uuid) -> SyncResult<()> {
        WorkerPoolScheduler::heartbeat(self, task_id).await.map(|_| ())
    }

    async fn is_cancel_requested(&self, task_id: Uuid) -> SyncResult<bool> {
        let (state, record) = self.locate(task_id).await?;
        if record.status == TaskStatus::Cancelled {
            return Ok(true);
        }
        state.has_cancel_flag(task_id).await
    }
}
