//! 结构化事件日志
//!
//! 每条记录都带 `event` 字段，便于在JSON日志中按事件类型检索。

use chrono::{DateTime, Utc};
use datasync_core::{JobKind, SyncRunRecord, TaskStatus};
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_submitted(task_id: Uuid, job_kind: &JobKind, priority: i32, queued: bool) {
        info!(
            event = "task_submitted",
            task.id = %task_id,
            job.source = %job_kind.source_system,
            job.operation = %job_kind.operation,
            task.priority = priority,
            task.queued = queued,
            "任务已提交"
        );
    }

    pub fn log_task_dispatched(task_id: Uuid, job_ref: &str, handle: &str) {
        info!(
            event = "task_dispatched",
            task.id = %task_id,
            job.reference = job_ref,
            job.handle = handle,
            "任务已分发到执行运行时"
        );
    }

    pub fn log_dispatch_rejected(task_id: Uuid, job_ref: &str, reason: &str) {
        warn!(
            event = "task_dispatch_rejected",
            task.id = %task_id,
            job.reference = job_ref,
            error = reason,
            "执行运行时拒绝了任务"
        );
    }

    /// 任务进入 Completed / Failed
    pub fn log_task_finished(
        task_id: Uuid,
        status: TaskStatus,
        started_at: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) {
        let duration_ms = started_at
            .map(|start| (Utc::now() - start).num_milliseconds())
            .unwrap_or(0);

        match status {
            TaskStatus::Completed => info!(
                event = "task_finished",
                task.id = %task_id,
                task.status = status.as_str(),
                task.duration_ms = duration_ms,
                "任务执行完成"
            ),
            _ => warn!(
                event = "task_finished",
                task.id = %task_id,
                task.status = status.as_str(),
                task.duration_ms = duration_ms,
                task.error = error_message.unwrap_or("未知错误"),
                "任务执行失败"
            ),
        }
    }

    pub fn log_task_cancelled(task_id: Uuid, previous: TaskStatus) {
        info!(
            event = "task_cancelled",
            task.id = %task_id,
            task.previous_status = previous.as_str(),
            "任务已取消"
        );
    }

    pub fn log_stale_task(task_id: Uuid, last_heartbeat: DateTime<Utc>, threshold_seconds: i64) {
        warn!(
            event = "task_stale",
            task.id = %task_id,
            task.last_heartbeat = %last_heartbeat,
            monitor.threshold_seconds = threshold_seconds,
            "任务心跳超时，标记为失败"
        );
    }

    pub fn log_sweep_completed(
        reconciled: usize,
        expired: usize,
        dispatched: usize,
        duration_ms: u64,
    ) {
        if reconciled + expired > 0 {
            info!(
                event = "sweep_completed",
                sweep.reconciled = reconciled,
                sweep.expired = expired,
                sweep.dispatched = dispatched,
                sweep.duration_ms = duration_ms,
                "对账扫描完成"
            );
        } else {
            tracing::debug!(
                event = "sweep_completed",
                sweep.dispatched = dispatched,
                sweep.duration_ms = duration_ms,
                "对账扫描完成，无异常任务"
            );
        }
    }

    pub fn log_sync_run_completed(run: &SyncRunRecord) {
        let duration_ms = run
            .performance_metrics
            .as_ref()
            .map(|m| m.duration_ms)
            .unwrap_or(0);

        info!(
            event = "sync_run_completed",
            run.id = run.id,
            job.source = %run.source_system,
            job.operation = %run.operation,
            run.status = run.status.as_str(),
            run.processed = run.counts.processed,
            run.created = run.counts.created,
            run.updated = run.counts.updated,
            run.failed = run.counts.failed,
            run.duration_ms = duration_ms,
            run.error = run.error_message.as_deref().unwrap_or(""),
            "同步运行结束"
        );
    }

    pub fn log_store_degraded(operation: &str, reason: &str) {
        warn!(
            event = "store_degraded",
            store.operation = operation,
            error = reason,
            "共享存储不可用，切换到本地降级视图"
        );
    }

    pub fn log_system_error(component: &str, operation: &str, err: &dyn std::error::Error) {
        error!(
            event = "system_error",
            component = component,
            operation = operation,
            error = %err,
            "系统错误"
        );
    }
}
