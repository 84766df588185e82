//! # datasync-api
//!
//! 同步调度系统的REST API，基于Axum构建。
//!
//! ## API 端点
//!
//! ### 任务
//! - `POST /api/tasks` - 提交同步作业
//! - `GET /api/tasks/{id}` - 查询任务状态
//! - `DELETE /api/tasks/{id}` - 取消任务
//! - `GET /api/tasks/active` - 运行中的任务
//! - `GET /api/tasks/queued` - 排队中的任务，按出队顺序
//!
//! ### 调度器
//! - `PUT /api/scheduler/workers` - 调整最大并发数
//! - `GET /api/scheduler/stats` - 调度器状态快照
//!
//! ### 同步历史
//! - `GET /api/sync-runs` - 按源系统、操作、状态和时间范围查询运行记录
//!
//! ### 健康检查
//! - `GET /health`
//!
//! 成功响应统一包装为 [`response::ApiResponse`]，错误响应由 [`error::ApiError`] 生成。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}

/// 启动API服务器，直到停止令牌被触发
pub async fn serve(
    state: AppState,
    bind_address: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("API绑定地址无效: {bind_address}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("无法绑定API地址 {addr}"))?;
    info!("API服务器监听于 {}", addr);

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API服务器异常退出")?;

    info!("API服务器已停止");
    Ok(())
}
