use axum::{
    routing::{get, put},
    Router,
};
use datasync_core::SyncRunRepository;
use datasync_dispatcher::WorkerPoolScheduler;
use std::sync::Arc;

use crate::handlers::{
    health::health_check,
    scheduler::{get_scheduler_stats, update_workers},
    sync_runs::list_sync_runs,
    tasks::{cancel_task, get_task, list_active_tasks, list_queued_tasks, submit_task},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<WorkerPoolScheduler>,
    pub sync_runs: Arc<dyn SyncRunRepository>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 任务
        .route("/api/tasks", axum::routing::post(submit_task))
        .route("/api/tasks/active", get(list_active_tasks))
        .route("/api/tasks/queued", get(list_queued_tasks))
        .route("/api/tasks/{id}", get(get_task).delete(cancel_task))
        // 调度器
        .route("/api/scheduler/workers", put(update_workers))
        .route("/api/scheduler/stats", get(get_scheduler_stats))
        // 同步历史
        .route("/api/sync-runs", get(list_sync_runs))
        .with_state(state)
}
