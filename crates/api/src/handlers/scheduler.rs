use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::ApiResult, response::ApiResponse, routes::AppState};

#[derive(Debug, Deserialize)]
pub struct UpdateWorkersRequest {
    pub max_workers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateWorkersResponse {
    pub previous: usize,
    pub max_workers: usize,
}

/// 调整最大并发数，缩小时不会中断运行中的任务
pub async fn update_workers(
    State(state): State<AppState>,
    Json(request): Json<UpdateWorkersRequest>,
) -> ApiResult<impl IntoResponse> {
    let previous = state.scheduler.reconfigure(request.max_workers).await?;
    info!("最大并发数由 {} 调整为 {}", previous, request.max_workers);

    Ok(ApiResponse::success_with_message(
        UpdateWorkersResponse {
            previous,
            max_workers: request.max_workers,
        },
        format!("最大并发数已调整为 {}", request.max_workers),
    ))
}

pub async fn get_scheduler_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(ApiResponse::success(state.scheduler.stats().await?))
}
