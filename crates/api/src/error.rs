use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use datasync_core::SyncError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("同步调度错误: {0}")]
    Sync(#[from] SyncError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, String, &'static str, Vec<String>) {
        match self {
            ApiError::Sync(SyncError::TaskNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("任务 {id} 不存在"),
                "TASK_NOT_FOUND",
                vec![
                    "请检查任务ID是否正确".to_string(),
                    "已结束的任务记录在保留期后会被清理".to_string(),
                ],
            ),
            ApiError::Sync(SyncError::RunNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("同步运行记录 {id} 不存在"),
                "RUN_NOT_FOUND",
                vec!["使用 GET /api/sync-runs 查看运行历史".to_string()],
            ),
            ApiError::Sync(SyncError::Admission(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("作业准入失败: {msg}"),
                "ADMISSION_ERROR",
                vec![
                    "请检查 source_system 和 operation 是否只包含字母、数字、下划线或连字符".to_string(),
                    "parameters 必须是JSON对象".to_string(),
                ],
            ),
            ApiError::Sync(e @ (SyncError::Validation(_) | SyncError::Configuration(_))) => (
                StatusCode::BAD_REQUEST,
                e.to_string(),
                "VALIDATION_ERROR",
                vec!["请检查请求参数是否符合要求".to_string()],
            ),
            ApiError::Sync(
                e @ (SyncError::InvalidTransition { .. } | SyncError::RunAlreadyFinished { .. }),
            ) => (
                StatusCode::CONFLICT,
                e.to_string(),
                "CONFLICT",
                vec!["请刷新资源状态后重试".to_string()],
            ),
            ApiError::Sync(e @ SyncError::StoreUnavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                e.to_string(),
                "STORE_UNAVAILABLE",
                vec![
                    "共享存储暂时不可达，请稍后重试".to_string(),
                    "查看 GET /health 检查系统状态".to_string(),
                ],
            ),
            ApiError::Sync(e @ SyncError::Dispatch(_)) => (
                StatusCode::BAD_GATEWAY,
                e.to_string(),
                "DISPATCH_ERROR",
                vec!["执行运行时拒绝了作业，请检查作业是否已注册".to_string()],
            ),
            ApiError::Sync(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR",
                vec![
                    "系统遇到内部错误，请稍后重试".to_string(),
                    format!("错误详情: {e}"),
                ],
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {msg}"),
                "BAD_REQUEST",
                vec!["请检查请求格式和参数".to_string()],
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, error_type, suggestions) = self.parts();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_of(error: ApiError) -> StatusCode {
        error.into_response().status()
    }

    #[test]
    fn test_sync_error_status_codes() {
        assert_eq!(
            status_of(SyncError::TaskNotFound { id: Uuid::new_v4() }.into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SyncError::Admission("bad kind".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(SyncError::Configuration("0".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(SyncError::StoreUnavailable("redis down".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(SyncError::RunAlreadyFinished { id: 1 }.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SyncError::Internal("boom".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_plain_errors() {
        assert_eq!(
            status_of(ApiError::BadRequest("limit".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
