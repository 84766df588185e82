use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

/// 调度器与同步管道指标
///
/// 未安装导出器时 `metrics` 宏返回空操作句柄，可以在测试中直接构造。
pub struct MetricsCollector {
    tasks_submitted_total: Counter,
    tasks_dispatched_total: Counter,
    tasks_completed_total: Counter,
    tasks_failed_total: Counter,
    tasks_cancelled_total: Counter,
    tasks_stale_total: Counter,
    dispatch_errors_total: Counter,
    store_degraded_total: Counter,

    tasks_running: Gauge,
    queue_depth: Gauge,
    max_workers: Gauge,

    sweep_duration: Histogram,

    pipeline_records_processed: Counter,
    pipeline_records_failed: Counter,
    pipeline_bulk_fallbacks_total: Counter,
    pipeline_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted_total: counter!("datasync_tasks_submitted_total"),
            tasks_dispatched_total: counter!("datasync_tasks_dispatched_total"),
            tasks_completed_total: counter!("datasync_tasks_completed_total"),
            tasks_failed_total: counter!("datasync_tasks_failed_total"),
            tasks_cancelled_total: counter!("datasync_tasks_cancelled_total"),
            tasks_stale_total: counter!("datasync_tasks_stale_total"),
            dispatch_errors_total: counter!("datasync_dispatch_errors_total"),
            store_degraded_total: counter!("datasync_store_degraded_total"),
            tasks_running: gauge!("datasync_tasks_running"),
            queue_depth: gauge!("datasync_queue_depth"),
            max_workers: gauge!("datasync_max_workers"),
            sweep_duration: histogram!("datasync_monitor_sweep_duration_seconds"),
            pipeline_records_processed: counter!("datasync_pipeline_records_total", "result" => "processed"),
            pipeline_records_failed: counter!("datasync_pipeline_records_total", "result" => "failed"),
            pipeline_bulk_fallbacks_total: counter!("datasync_pipeline_bulk_fallbacks_total"),
            pipeline_duration: histogram!("datasync_pipeline_duration_seconds"),
        }
    }

    pub fn record_task_submitted(&self) {
        self.tasks_submitted_total.increment(1);
    }

    pub fn record_task_dispatched(&self) {
        self.tasks_dispatched_total.increment(1);
    }

    pub fn record_task_completed(&self) {
        self.tasks_completed_total.increment(1);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed_total.increment(1);
    }

    pub fn record_task_cancelled(&self) {
        self.tasks_cancelled_total.increment(1);
    }

    pub fn record_task_stale(&self) {
        self.tasks_stale_total.increment(1);
    }

    pub fn record_dispatch_error(&self) {
        self.dispatch_errors_total.increment(1);
    }

    pub fn record_store_degraded(&self) {
        self.store_degraded_total.increment(1);
    }

    /// 更新运行中任务数与排队深度
    pub fn update_pool(&self, running: usize, queued: usize) {
        self.tasks_running.set(running as f64);
        self.queue_depth.set(queued as f64);
    }

    pub fn update_max_workers(&self, max_workers: usize) {
        self.max_workers.set(max_workers as f64);
    }

    pub fn record_sweep_duration(&self, seconds: f64) {
        self.sweep_duration.record(seconds);
    }

    pub fn record_pipeline_run(&self, processed: i64, failed: i64, duration_seconds: f64) {
        self.pipeline_records_processed.increment(processed.max(0) as u64);
        self.pipeline_records_failed.increment(failed.max(0) as u64);
        self.pipeline_duration.record(duration_seconds);
    }

    pub fn record_bulk_fallback(&self) {
        self.pipeline_bulk_fallbacks_total.increment(1);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        let metrics = MetricsCollector::default();
        metrics.record_task_submitted();
        metrics.record_task_dispatched();
        metrics.update_pool(2, 5);
        metrics.update_max_workers(4);
        metrics.record_pipeline_run(11, 1, 0.5);
        metrics.record_sweep_duration(0.01);
    }
}
