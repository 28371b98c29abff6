//! Prometheus 指标：分发请求数、Android 发送结果、iOS 提交与网关响应、feedback 事件
//!
//! 通过 `init()` 安装全局 Recorder，通过 HTTP GET `/metrics` 暴露抓取端点。
//! 未初始化时各 `record_*` 调用是空操作。

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_DISPATCH_TOTAL: &str = "unipush_dispatch_total";
const COUNTER_ACCESS_DENIED: &str = "unipush_access_denied_total";
const COUNTER_ANDROID_SEND: &str = "unipush_android_send_total";
const COUNTER_IOS_SUBMITTED: &str = "unipush_ios_submitted_total";
const COUNTER_IOS_GATEWAY: &str = "unipush_ios_gateway_responses_total";
const COUNTER_FEEDBACK_EVENTS: &str = "unipush_feedback_events_total";
const COUNTER_FEEDBACK_POLL_FAILED: &str = "unipush_feedback_poll_failures_total";

/// 初始化 Prometheus 指标（安装全局 Recorder，返回 Handle 用于 HTTP 暴露）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 渲染当前指标为 Prometheus 文本格式，供 GET /metrics 使用。
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 记录一次分发请求，`kind` 为 none / android / ios / both
pub fn record_dispatch(kind: &str) {
    metrics::counter!(COUNTER_DISPATCH_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_access_denied() {
    metrics::counter!(COUNTER_ACCESS_DENIED).increment(1);
}

/// 记录一次 Android 发送（含全部重试）的最终结果
pub fn record_android_send(result: &str) {
    metrics::counter!(COUNTER_ANDROID_SEND, "result" => result.to_string()).increment(1);
}

pub fn record_ios_submitted() {
    metrics::counter!(COUNTER_IOS_SUBMITTED).increment(1);
}

/// 记录 iOS 网关响应；没有 HTTP 状态（传输错误）记为 "transport"
pub fn record_ios_gateway(status: Option<u16>) {
    let status = status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "transport".to_string());
    metrics::counter!(COUNTER_IOS_GATEWAY, "status" => status).increment(1);
}

pub fn record_feedback_events(count: usize) {
    metrics::counter!(COUNTER_FEEDBACK_EVENTS).increment(count as u64);
}

pub fn record_feedback_poll_failure() {
    metrics::counter!(COUNTER_FEEDBACK_POLL_FAILED).increment(1);
}
