//! 推送分发路由
//!
//! POST /pushnotifications
//! Headers: X-Service-Key: <service_key>（可选，用于标识内部调用方）
//! Body: NotificationRequest

use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{Extensions, HeaderMap},
    response::Json,
    routing::post,
    Router,
};
use tracing::{debug, warn};

use crate::error::{Result, ServerError};
use crate::http::HttpServerState;
use crate::push::{CallerContext, DispatchOutcome, NotificationRequest};

pub const SERVICE_KEY_HEADER: &str = "X-Service-Key";

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route("/pushnotifications", post(dispatch_notification))
}

async fn dispatch_notification(
    State(state): State<HttpServerState>,
    headers: HeaderMap,
    extensions: Extensions,
    payload: std::result::Result<Json<NotificationRequest>, JsonRejection>,
) -> Result<Json<DispatchOutcome>> {
    let caller = caller_context(&headers, &extensions, &state);

    let Json(request) = payload.map_err(|rejection| {
        warn!("[HTTP] Malformed push request: {}", rejection.body_text());
        ServerError::InvalidRequest(rejection.body_text())
    })?;

    let outcome = state.handler.dispatch(request, caller).await?;
    Ok(Json(outcome))
}

/// 判断调用方是否为内部调用方
///
/// `X-Service-Key` 与配置的密钥一致；开启 `trust_loopback` 时回环地址也算。
fn caller_context(headers: &HeaderMap, extensions: &Extensions, state: &HttpServerState) -> CallerContext {
    let loopback = state.trust_loopback
        && extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().is_loopback())
            .unwrap_or(false);
    if loopback {
        debug!("[HTTP] Loopback caller treated as internal");
        return CallerContext::internal();
    }

    let presented = headers
        .get(SERVICE_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    match (presented, state.service_key.as_deref()) {
        (Some(presented), Some(expected)) if !expected.is_empty() && presented == expected => {
            CallerContext::internal()
        }
        (Some(_), _) => {
            warn!("[HTTP] Invalid X-Service-Key, caller treated as external");
            CallerContext::external()
        }
        _ => CallerContext::external(),
    }
}
