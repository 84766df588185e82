use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use datasync_core::{JobKind, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

/// 作业提交请求
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub source_system: String,
    pub operation: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    pub task_id: Uuid,
    /// 任务已处于终态时为 false
    pub cancelled: bool,
}

/// 提交作业
pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.source_system.trim().is_empty() || request.operation.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "source_system 和 operation 不能为空".to_string(),
        ));
    }

    let job_kind = JobKind::new(request.source_system, request.operation);
    let task_id = state
        .scheduler
        .submit(job_kind, request.parameters, request.priority)
        .await?;
    let record = state.scheduler.get_status(task_id).await?;

    Ok(created(SubmitTaskResponse {
        task_id,
        status: record.status,
    }))
}

/// 查询任务状态
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let record = state.scheduler.get_status(id).await?;
    Ok(success(record))
}

/// 取消任务
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state.scheduler.cancel(id).await?;
    Ok(success(CancelTaskResponse {
        task_id: id,
        cancelled,
    }))
}

pub async fn list_active_tasks(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.scheduler.list_active().await?))
}

/// 排队任务，按出队顺序
pub async fn list_queued_tasks(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.scheduler.list_queued().await?))
}
