use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::PushConfig;
use crate::error::{Result, ServerError};
use crate::infra::metrics;
use crate::push::provider::provider_trait::AndroidChannel;
use crate::push::types::{AndroidMessage, DeliveryReport, DeviceResult};

/// GCM/FCM legacy HTTP 接口
pub const DEFAULT_GCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// 通道级重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub max_attempts: u32,
    /// 第一次重试前的等待时间，之后每次翻倍
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// 第 `retry` 次重试（从 1 开始）前的等待时间，带 25% 以内的抖动
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp = retry.saturating_sub(1).min(16);
        let delay_ms = base_ms.saturating_mul(1u64 << exp);
        let jitter = fastrand::u64(0..=delay_ms / 4);
        Duration::from_millis(delay_ms.saturating_add(jitter))
    }
}

/// GCM 响应
#[derive(Debug, Deserialize)]
struct GcmResponse {
    multicast_id: Option<i64>,
    #[serde(default)]
    results: Vec<GcmResult>,
}

#[derive(Debug, Deserialize)]
struct GcmResult {
    message_id: Option<String>,
    registration_id: Option<String>,
    error: Option<String>,
}

impl From<GcmResult> for DeviceResult {
    fn from(result: GcmResult) -> Self {
        match (result.error, result.message_id, result.registration_id) {
            (Some(error), _, _) => DeviceResult::Failed { error },
            (None, Some(message_id), Some(registration_id)) => DeviceResult::CanonicalId {
                message_id,
                registration_id,
            },
            (None, Some(message_id), None) => DeviceResult::Delivered { message_id },
            (None, None, _) => DeviceResult::Failed {
                error: "MissingMessageId".to_string(),
            },
        }
    }
}

/// FCM Provider
///
/// 使用 GCM legacy HTTP 接口，`Authorization: key=<server key>` 认证。
/// 进程内只创建一次，内部的 reqwest Client 复用连接池。
pub struct FcmProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    retry: RetryPolicy,
}

impl FcmProvider {
    /// 创建新的 FCM Provider
    ///
    /// # 参数
    /// - api_key: GCM API Server Key
    /// - endpoint: 网关地址，通常为 [`DEFAULT_GCM_ENDPOINT`]
    /// - retry: 通道级重试策略
    /// - send_timeout: 单次 HTTP 请求超时
    pub fn new(
        api_key: String,
        endpoint: String,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(send_timeout)
            .build()
            .map_err(|e| ServerError::Configuration(format!("Failed to build GCM client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            retry,
        })
    }

    pub fn from_config(config: &PushConfig) -> Result<Self> {
        Self::new(
            config.gcm_api_server_key.clone(),
            config.gcm_endpoint.clone(),
            RetryPolicy {
                base_delay: Duration::from_millis(config.gcm_retry_base_delay_ms),
                ..RetryPolicy::default()
            },
            config.send_timeout(),
        )
    }

    /// 构建 GCM 消息 payload
    fn build_gcm_payload(&self, message: &AndroidMessage, targets: &[String]) -> Value {
        let mut data = Map::new();
        data.insert("title".to_string(), json!(message.title));
        data.insert("message".to_string(), json!(message.message));
        if let Some(msgcnt) = message.msgcnt {
            data.insert("msgcnt".to_string(), json!(msgcnt));
        }
        if let Some(sound) = &message.sound {
            data.insert("soundname".to_string(), json!(sound));
        }

        let mut payload = json!({
            "registration_ids": targets,
            "data": data,
            "time_to_live": message.time_to_live,
        });
        if let Some(collapse_key) = &message.collapse_key {
            payload["collapse_key"] = json!(collapse_key);
        }
        if let Some(delay_while_idle) = message.delay_while_idle {
            payload["delay_while_idle"] = json!(delay_while_idle);
        }
        payload
    }

    async fn post_once(&self, message: &AndroidMessage, targets: &[String]) -> Result<GcmResponse> {
        let payload = self.build_gcm_payload(message, targets);

        let response = self
            .client
            .post(&self.endpoint)
            .header(header::AUTHORIZATION, format!("key={}", self.api_key))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response.json::<GcmResponse>().await.map_err(|e| {
                ServerError::Serialization(format!("Malformed GCM response: {}", e))
            });
        }

        let error_text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::BAD_REQUEST => Err(ServerError::InvalidRequest(format!(
                "GCM rejected the message: {}",
                error_text
            ))),
            StatusCode::UNAUTHORIZED => Err(ServerError::Authentication(
                "GCM rejected the API server key".to_string(),
            )),
            s if s.is_server_error() => Err(ServerError::ServiceUnavailable(format!(
                "GCM status={}, error={}",
                s, error_text
            ))),
            s => Err(ServerError::Internal(format!(
                "GCM push failed: status={}, error={}",
                s, error_text
            ))),
        }
    }
}

#[async_trait]
impl AndroidChannel for FcmProvider {
    async fn send(&self, message: &AndroidMessage, targets: &[String]) -> Result<DeliveryReport> {
        let mut report = DeliveryReport::default();
        if targets.is_empty() {
            return Ok(report);
        }

        let mut pending: Vec<String> = targets.to_vec();
        let mut last_error: Option<ServerError> = None;
        let mut answered = false;

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.delay_for(attempt - 1);
                debug!("[FCM] Backing off {:?} before attempt {}", delay, attempt);
                tokio::time::sleep(delay).await;
            }

            info!(
                "[FCM] Sending push: attempt={}/{}, devices={}",
                attempt,
                self.retry.max_attempts,
                pending.len()
            );

            match self.post_once(message, &pending).await {
                Ok(response) => {
                    answered = true;
                    last_error = None;
                    if response.multicast_id.is_some() {
                        report.multicast_id = response.multicast_id;
                    }

                    // results 与 registration_ids 按下标一一对应
                    let mut results = response.results.into_iter();
                    let mut retry = Vec::new();
                    for device_id in &pending {
                        let result = results.next().map(DeviceResult::from).unwrap_or_else(|| {
                            DeviceResult::Failed {
                                error: "MissingResult".to_string(),
                            }
                        });
                        if result.is_retryable() {
                            retry.push(device_id.clone());
                        }
                        report.record(device_id, result);
                    }

                    pending = retry;
                    if pending.is_empty() {
                        break;
                    }
                    warn!("[FCM] {} device(s) temporarily unavailable", pending.len());
                }
                Err(e) if e.is_transient() => {
                    warn!("[FCM] Transient failure on attempt {}: {}", attempt, e);
                    last_error = Some(e);
                }
                Err(e) if answered => {
                    // 已有网关应答，保留报告，待重试设备沿用上次的设备级结果
                    warn!(
                        "[FCM] Retry of {} device(s) aborted on attempt {}: {}",
                        pending.len(),
                        attempt,
                        e
                    );
                    break;
                }
                Err(e) => {
                    error!("[FCM] Push failed: {}", e);
                    metrics::record_android_send("error");
                    return Err(e);
                }
            }
        }

        if !answered {
            let cause = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string());
            error!(
                "[FCM] Push failed after {} attempt(s): {}",
                self.retry.max_attempts, cause
            );
            metrics::record_android_send("error");
            return Err(ServerError::Network(format!(
                "GCM send failed after {} attempt(s): {}",
                self.retry.max_attempts, cause
            )));
        }

        report.recount();
        info!(
            "[FCM] Push sent: multicast_id={:?}, success={}, failure={}, canonical_ids={}",
            report.multicast_id, report.success, report.failure, report.canonical_ids
        );
        metrics::record_android_send("ok");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> FcmProvider {
        FcmProvider::new(
            "test-key".to_string(),
            format!("{}/fcm/send", server.uri()),
            RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn message() -> AndroidMessage {
        AndroidMessage {
            title: "Notification".to_string(),
            message: "Hello".to_string(),
            time_to_live: 3000,
            msgcnt: None,
            sound: None,
            collapse_key: None,
            delay_while_idle: None,
        }
    }

    fn targets(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_payload_optional_fields() {
        let fcm = FcmProvider::new(
            "k".to_string(),
            DEFAULT_GCM_ENDPOINT.to_string(),
            RetryPolicy::default(),
            Duration::from_secs(1),
        )
        .unwrap();

        let plain = fcm.build_gcm_payload(&message(), &targets(&["dev1"]));
        assert_eq!(plain["registration_ids"], json!(["dev1"]));
        assert_eq!(plain["time_to_live"], 3000);
        assert!(plain.get("collapse_key").is_none());
        assert!(plain.get("delay_while_idle").is_none());
        assert!(plain["data"].get("msgcnt").is_none());

        let full = AndroidMessage {
            msgcnt: Some(3),
            sound: Some("ping".to_string()),
            collapse_key: Some("orders".to_string()),
            delay_while_idle: Some(true),
            ..message()
        };
        let payload = fcm.build_gcm_payload(&full, &targets(&["dev1"]));
        assert_eq!(payload["data"]["msgcnt"], 3);
        assert_eq!(payload["data"]["soundname"], "ping");
        assert_eq!(payload["collapse_key"], "orders");
        assert_eq!(payload["delay_while_idle"], true);
    }

    #[test]
    fn test_retry_delay_grows() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        let first = policy.delay_for(1);
        let third = policy.delay_for(3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_send_returns_report_keyed_by_device() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .and(header_eq("authorization", "key=test-key"))
            .and(body_partial_json(json!({
                "registration_ids": ["dev1", "dev2", "dev3"],
                "data": { "title": "Notification", "message": "Hello" },
                "time_to_live": 3000
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "multicast_id": 77,
                "success": 2,
                "failure": 1,
                "canonical_ids": 1,
                "results": [
                    { "message_id": "m1" },
                    { "message_id": "m2", "registration_id": "dev2-new" },
                    { "error": "NotRegistered" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let report = provider(&server)
            .send(&message(), &targets(&["dev1", "dev2", "dev3"]))
            .await
            .unwrap();

        assert_eq!(report.multicast_id, Some(77));
        assert_eq!(report.success, 2);
        assert_eq!(report.failure, 1);
        assert_eq!(report.canonical_ids, 1);
        assert_eq!(
            report.results["dev2"],
            DeviceResult::CanonicalId {
                message_id: "m2".to_string(),
                registration_id: "dev2-new".to_string()
            }
        );
        assert_eq!(
            report.results["dev3"],
            DeviceResult::Failed {
                error: "NotRegistered".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_bad_credential_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .send(&message(), &targets(&["dev1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_malformed_message_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("InvalidTtl"))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .send(&message(), &targets(&["dev1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let err = provider(&server)
            .send(&message(), &targets(&["dev1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Network(_)));
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out_and_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(4)
            .mount(&server)
            .await;

        let fcm = FcmProvider::new(
            "test-key".to_string(),
            format!("{}/fcm/send", server.uri()),
            RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
            },
            Duration::from_millis(100),
        )
        .unwrap();

        let err = fcm.send(&message(), &targets(&["dev1"])).await.unwrap_err();
        assert!(matches!(err, ServerError::Network(_)));
    }

    #[tokio::test]
    async fn test_fatal_error_after_answer_keeps_report() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "multicast_id": 5,
                "results": [
                    { "message_id": "m1" },
                    { "error": "Unavailable" }
                ]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let report = provider(&server)
            .send(&message(), &targets(&["dev1", "dev2"]))
            .await
            .unwrap();

        assert_eq!(report.multicast_id, Some(5));
        assert_eq!(report.success, 1);
        assert_eq!(report.failure, 1);
        assert_eq!(
            report.results["dev2"],
            DeviceResult::Failed {
                error: "Unavailable".to_string()
            }
        );
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_devices_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "multicast_id": 1,
                "results": [
                    { "message_id": "m1" },
                    { "error": "Unavailable" }
                ]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "multicast_id": 2,
                "results": [ { "message_id": "m2" } ]
            })))
            .mount(&server)
            .await;

        let report = provider(&server)
            .send(&message(), &targets(&["dev1", "dev2"]))
            .await
            .unwrap();

        assert_eq!(report.success, 2);
        assert_eq!(report.failure, 0);
        assert_eq!(
            report.results["dev2"],
            DeviceResult::Delivered {
                message_id: "m2".to_string()
            }
        );

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(second["registration_ids"], json!(["dev2"]));
    }
}
