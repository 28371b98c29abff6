//! HTTP 服务器 - 使用 Axum 提供推送分发接口

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::http::routes;
use crate::push::DispatchHandler;

/// HTTP 服务器共享状态
#[derive(Clone)]
pub struct HttpServerState {
    pub handler: Arc<DispatchHandler>,
    /// 内部调用方密钥（对应 X-Service-Key）
    pub service_key: Option<String>,
    /// 回环地址的对端是否视为内部调用方
    pub trust_loopback: bool,
}

/// 构建完整路由
pub fn build_router(state: HttpServerState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 推送 HTTP 服务器
pub struct PushHttpServer {
    state: HttpServerState,
    host: String,
    port: u16,
}

impl PushHttpServer {
    pub fn new(state: HttpServerState, host: String, port: u16) -> Self {
        Self { state, host, port }
    }

    /// 启动 HTTP 服务器，`shutdown` 变为 true 时优雅退出
    pub async fn start(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = build_router(self.state.clone());

        // 绑定地址
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("🌐 HTTP 服务器启动在 {}", addr);

        // 需要对端地址判断内部调用方
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

        info!("🌐 HTTP 服务器已停止");
        Ok(())
    }
}
