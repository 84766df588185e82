use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::routes::AppState;

/// 健康检查，共享存储不可达时返回 503
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (status, store) = match state.scheduler.check_store().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            warn!("健康检查: 共享存储不可达: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    };

    (
        status,
        Json(json!({
            "status": if status.is_success() { "ok" } else { "degraded" },
            "store": store,
            "instance_id": state.scheduler.instance_id(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "datasync",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}
