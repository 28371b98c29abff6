use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use pkcs8::der::pem::LineEnding;
use pkcs8::EncryptedPrivateKeyInfo;
use reqwest::{Client, Identity, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PushConfig;
use crate::error::{Result, ServerError};
use crate::infra::metrics;
use crate::push::provider::provider_trait::{FeedbackSource, IosChannel};
use crate::push::types::{DeviceToken, FeedbackRecord, IosNotification};

pub const SANDBOX_HOST: &str = "api.sandbox.push.apple.com";
pub const PRODUCTION_HOST: &str = "api.push.apple.com";

/// 等待 FeedbackPoller 取走的失效 Token 上限，超出时丢弃最早的记录
pub const DEFAULT_FEEDBACK_CAPACITY: usize = 10_000;

/// 把配置里的网关地址换算成 HTTP/2 接口地址
///
/// 旧的二进制协议主机名（`gateway.sandbox.push.apple.com` 等）映射到对应的
/// HTTP/2 主机，其余值原样使用，未带协议时补 `https://`。
pub fn resolve_gateway_url(gateway: &str) -> String {
    let gateway = gateway.trim().trim_end_matches('/');
    if gateway.starts_with("http://") || gateway.starts_with("https://") {
        return gateway.to_string();
    }

    let host = gateway.split(':').next().unwrap_or_default();
    match host {
        "" | "gateway.sandbox.push.apple.com" => format!("https://{}", SANDBOX_HOST),
        "gateway.push.apple.com" => format!("https://{}", PRODUCTION_HOST),
        _ => format!("https://{}", gateway),
    }
}

/// 读取客户端证书和私钥，私钥加密时用 passphrase 解密
///
/// 证书或私钥文件不存在时返回 `Ok(None)`，连接仍会建立，但网关会拒绝请求。
pub fn load_identity(cert_path: &Path, key_path: &Path, passphrase: &str) -> Result<Option<Identity>> {
    if !cert_path.exists() || !key_path.exists() {
        warn!(
            "[APNs] Certificate or key not found (cert={}, key={}), connecting without client identity",
            cert_path.display(),
            key_path.display()
        );
        return Ok(None);
    }

    let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
        ServerError::Configuration(format!("Failed to read APNs certificate: {}", e))
    })?;
    let key_pem = fs::read_to_string(key_path)
        .map_err(|e| ServerError::Configuration(format!("Failed to read APNs private key: {}", e)))?;
    let key_pem = decrypt_private_key(&key_pem, passphrase)?;

    let mut bundle = cert_pem.into_bytes();
    bundle.push(b'\n');
    bundle.extend_from_slice(key_pem.as_bytes());

    Identity::from_pem(&bundle)
        .map(Some)
        .map_err(|e| ServerError::Configuration(format!("Invalid APNs certificate/key: {}", e)))
}

fn decrypt_private_key(key_pem: &str, passphrase: &str) -> Result<String> {
    if key_pem.contains("Proc-Type: 4,ENCRYPTED") {
        return Err(ServerError::Configuration(
            "legacy OpenSSL-encrypted keys are not supported, convert with `openssl pkcs8 -topk8`"
                .to_string(),
        ));
    }
    if !key_pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
        return Ok(key_pem.to_string());
    }

    let (_, der) = pkcs8::der::pem::decode_vec(key_pem.trim().as_bytes())
        .map_err(|e| ServerError::Configuration(format!("Malformed APNs private key: {}", e)))?;
    let info = EncryptedPrivateKeyInfo::try_from(der.as_slice())
        .map_err(|e| ServerError::Configuration(format!("Malformed APNs private key: {}", e)))?;
    let document = info.decrypt(passphrase.as_bytes()).map_err(|e| {
        ServerError::Configuration(format!("Failed to decrypt APNs private key: {}", e))
    })?;
    let pem = document
        .to_pem("PRIVATE KEY", LineEnding::LF)
        .map_err(|e| ServerError::Configuration(format!("Failed to encode APNs private key: {}", e)))?;

    Ok(pem.as_str().to_owned())
}

/// APNs 连接参数
#[derive(Debug, Clone)]
pub struct ApnsSettings {
    pub base_url: String,
    pub topic: Option<String>,
    pub send_timeout: Duration,
    pub queue_capacity: usize,
    pub concurrency: usize,
    pub feedback_capacity: usize,
}

impl ApnsSettings {
    pub fn from_config(config: &PushConfig) -> Self {
        Self {
            base_url: resolve_gateway_url(&config.apn_gateway),
            topic: config.apn_topic.clone().filter(|t| !t.is_empty()),
            send_timeout: config.send_timeout(),
            queue_capacity: config.ios_queue_capacity.max(1),
            concurrency: config.ios_concurrency.max(1),
            feedback_capacity: DEFAULT_FEEDBACK_CAPACITY,
        }
    }
}

/// 网关对一次提交的处理结果（只用于内部观测）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnsDelivery {
    pub token: String,
    pub apns_id: String,
    /// HTTP 状态码，传输层失败时为 `None`
    pub status: Option<u16>,
    pub reason: Option<String>,
}

impl ApnsDelivery {
    pub fn is_success(&self) -> bool {
        self.status == Some(200)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApnsErrorBody {
    reason: Option<String>,
    /// 毫秒
    timestamp: Option<i64>,
}

struct ApnsJob {
    notification: IosNotification,
    token: DeviceToken,
    apns_id: Uuid,
}

/// 构建 APNs 消息 payload，自定义字段与 `aps` 同级
fn build_apns_payload(notification: &IosNotification) -> Value {
    let mut aps = Map::new();
    aps.insert("alert".to_string(), json!(notification.alert));
    aps.insert("badge".to_string(), json!(notification.badge));
    if let Some(sound) = &notification.sound {
        aps.insert("sound".to_string(), json!(sound));
    }

    let mut body = notification.payload.clone();
    body.insert("aps".to_string(), Value::Object(aps));
    Value::Object(body)
}

type FeedbackQueue = Arc<Mutex<VecDeque<FeedbackRecord>>>;

/// 持有长连接的后台任务
struct ApnsConnection {
    client: Client,
    base_url: String,
    topic: Option<String>,
    feedback: FeedbackQueue,
    feedback_capacity: usize,
    results: broadcast::Sender<ApnsDelivery>,
}

impl ApnsConnection {
    async fn run(
        self: Arc<Self>,
        receiver: mpsc::Receiver<ApnsJob>,
        mut shutdown: watch::Receiver<bool>,
        concurrency: usize,
    ) {
        info!("[APNs] Connection worker started: {}", self.base_url);

        let stop = async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        };

        ReceiverStream::new(receiver)
            .take_until(stop)
            .for_each_concurrent(concurrency, |job| {
                let conn = Arc::clone(&self);
                async move { conn.deliver(job).await }
            })
            .await;

        info!("[APNs] Connection worker stopped");
    }

    async fn deliver(&self, job: ApnsJob) {
        let url = format!("{}/3/device/{}", self.base_url, job.token);
        let body = build_apns_payload(&job.notification);
        let expiration = job.notification.expiration_at(Utc::now());

        let mut request = self
            .client
            .post(&url)
            .header("apns-id", job.apns_id.to_string())
            .header("apns-expiration", expiration.to_string())
            .header("apns-priority", "10")
            .header("apns-push-type", "alert")
            .json(&body);
        if let Some(topic) = &self.topic {
            request = request.header("apns-topic", topic);
        }

        let mut delivery = ApnsDelivery {
            token: job.token.to_string(),
            apns_id: job.apns_id.to_string(),
            status: None,
            reason: None,
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                delivery.status = Some(status.as_u16());
                if status.is_success() {
                    debug!("[APNs] Push accepted: token={}, apns_id={}", job.token, job.apns_id);
                } else {
                    let text = response.text().await.unwrap_or_default();
                    let error: ApnsErrorBody = serde_json::from_str(&text).unwrap_or_default();
                    warn!(
                        "[APNs] Push rejected: token={}, status={}, reason={:?}",
                        job.token, status, error.reason
                    );
                    self.record_invalid_token(&job.token, status, &error);
                    delivery.reason = error.reason.or(Some(text).filter(|t| !t.is_empty()));
                }
            }
            Err(e) => {
                error!("[APNs] Request failed: token={}, error={}", job.token, e);
                delivery.reason = Some(e.to_string());
            }
        }

        metrics::record_ios_gateway(delivery.status);
        // 没有订阅者时发送失败，属正常情况
        let _ = self.results.send(delivery);
    }

    fn record_invalid_token(&self, token: &DeviceToken, status: StatusCode, error: &ApnsErrorBody) {
        let invalidated_at = match (status, error.reason.as_deref()) {
            (StatusCode::GONE, _) => error
                .timestamp
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now),
            (StatusCode::BAD_REQUEST, Some("BadDeviceToken")) => Utc::now(),
            _ => return,
        };

        let mut queue = self.feedback.lock();
        if queue.len() >= self.feedback_capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    "[APNs] Feedback queue full ({}), dropping oldest token={}",
                    self.feedback_capacity, dropped.token
                );
            }
        }
        queue.push_back(FeedbackRecord {
            token: token.to_string(),
            invalidated_at,
        });
    }
}

/// APNs Provider
///
/// 证书认证的 HTTP/2 长连接，进程内只建立一次。`send` 只把通知放进队列，
/// 不等待网关结果；网关判定失效的 Token 进入 feedback 队列，由
/// FeedbackPoller 定期取走。
pub struct ApnsProvider {
    sender: mpsc::Sender<ApnsJob>,
    feedback: FeedbackQueue,
    results: broadcast::Sender<ApnsDelivery>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    send_timeout: Duration,
}

impl ApnsProvider {
    /// 建立连接并启动后台任务，必须在 tokio runtime 内调用
    pub fn connect(settings: ApnsSettings, identity: Option<Identity>) -> Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(settings.send_timeout)
            .pool_idle_timeout(None::<Duration>)
            .http2_keep_alive_interval(Duration::from_secs(60))
            .http2_keep_alive_while_idle(true);
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| ServerError::Configuration(format!("Failed to build APNs client: {}", e)))?;

        let (sender, receiver) = mpsc::channel(settings.queue_capacity);
        let (results, _) = broadcast::channel(256);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let feedback = Arc::new(Mutex::new(VecDeque::new()));

        let connection = Arc::new(ApnsConnection {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            topic: settings.topic,
            feedback: feedback.clone(),
            feedback_capacity: settings.feedback_capacity.max(1),
            results: results.clone(),
        });
        let worker = tokio::spawn(connection.run(receiver, shutdown_rx, settings.concurrency));

        Ok(Self {
            sender,
            feedback,
            results,
            shutdown,
            worker: Mutex::new(Some(worker)),
            send_timeout: settings.send_timeout,
        })
    }

    pub fn from_config(config: &PushConfig) -> Result<Self> {
        let identity = load_identity(
            Path::new(&config.cert_pem_location),
            Path::new(&config.key_pem_location),
            &config.key_pem_passphrase,
        )?;
        Self::connect(ApnsSettings::from_config(config), identity)
    }

    /// 订阅网关处理结果
    pub fn subscribe_results(&self) -> broadcast::Receiver<ApnsDelivery> {
        self.results.subscribe()
    }

    pub fn pending_feedback(&self) -> usize {
        self.feedback.lock().len()
    }

    /// 停止后台任务，已出队的请求会处理完
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("[APNs] Connection worker panicked: {}", e);
            }
        }
    }
}

#[async_trait]
impl IosChannel for ApnsProvider {
    async fn send(&self, notification: IosNotification, target: DeviceToken) -> Result<()> {
        let job = ApnsJob {
            notification,
            token: target,
            apns_id: Uuid::new_v4(),
        };
        let apns_id = job.apns_id;

        tokio::time::timeout(self.send_timeout, self.sender.send(job))
            .await?
            .map_err(|_| ServerError::ServiceUnavailable("APNs connection is closed".to_string()))?;

        debug!("[APNs] Push queued: apns_id={}", apns_id);
        metrics::record_ios_submitted();
        Ok(())
    }
}

#[async_trait]
impl FeedbackSource for ApnsProvider {
    async fn fetch_feedback(&self) -> Result<Vec<FeedbackRecord>> {
        Ok(self.feedback.lock().drain(..).collect())
    }
}
