//! HTTP 路由模块
//!
//! 路由结构：
//! - `/pushnotifications` - 推送分发（业务系统调用，内部调用方用 X-Service-Key 标识）
//! - `/health`            - 健康检查
//! - `/metrics`           - Prometheus 抓取端点

pub mod health;
pub mod metrics;
pub mod push;

use axum::{routing::get, Router};
use crate::http::HttpServerState;

/// 创建所有路由
pub fn create_routes() -> Router<HttpServerState> {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .route("/health", get(health::health_handler))
        .merge(push::create_route())     // /pushnotifications - 推送分发
}
