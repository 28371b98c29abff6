//! HTTP 服务器模块 - 使用 Axum 暴露推送分发接口
//!
//! 功能包括：
//! - 推送分发接口（POST /pushnotifications）
//! - 健康检查（GET /health）
//! - Prometheus 指标（GET /metrics）

pub mod routes;
pub mod server;

pub use server::{build_router, HttpServerState, PushHttpServer};
