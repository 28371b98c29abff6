use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::http::{HttpServerState, PushHttpServer};
use crate::push::provider::{AndroidChannel, ApnsProvider, FcmProvider, IosChannel};
use crate::push::{DispatchHandler, FeedbackHub, FeedbackPoller, FeedbackRecord};

/// 推送服务器
///
/// 持有进程级资源：两个通道、feedback 总线和后台任务，负责启动与关闭。
pub struct PushServer {
    config: ServerConfig,
    handler: Arc<DispatchHandler>,
    apns: Arc<ApnsProvider>,
    feedback: Arc<FeedbackHub>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PushServer {
    /// 创建服务器并建立通道
    ///
    /// iOS 连接在这里建立，需要在 tokio 运行时内调用。
    pub fn new(config: ServerConfig) -> Result<Self> {
        let push_config = Arc::new(config.push.clone());

        let android: Option<Arc<dyn AndroidChannel>> = if push_config.android_enabled() {
            let fcm = FcmProvider::from_config(&push_config)?;
            info!("✅ Android 通道已启用: {}", push_config.gcm_endpoint);
            Some(Arc::new(fcm))
        } else {
            warn!("⚠️ 未配置 gcm_api_server_key，Android 通道未启用");
            None
        };

        let apns = Arc::new(ApnsProvider::from_config(&push_config)?);
        info!("✅ iOS 通道已启用: {}", push_config.apn_gateway);
        let ios: Option<Arc<dyn IosChannel>> = Some(apns.clone());

        let handler = Arc::new(DispatchHandler::new(push_config, android, ios));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            handler,
            apns,
            feedback: Arc::new(FeedbackHub::default()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn handler(&self) -> Arc<DispatchHandler> {
        self.handler.clone()
    }

    /// 订阅 feedback 事件（失效的 iOS Token）
    ///
    /// 需要在 `run` 之前订阅；订阅者处理慢时 feedback 轮询会随之放慢。
    pub fn subscribe_feedback(&self) -> mpsc::Receiver<FeedbackRecord> {
        self.feedback.subscribe()
    }

    /// 运行服务器，直到收到 Ctrl-C 或 HTTP 服务器退出
    pub async fn run(&self) -> Result<()> {
        info!("🚀 启动推送服务器...");
        self.show_config_info();

        // 初始化 Prometheus 指标（供 GET /metrics 暴露）
        if crate::infra::metrics::init().is_ok() {
            info!("📊 Prometheus 指标已启用，GET /metrics 可用");
        }

        self.start_background_tasks();

        let http_server = PushHttpServer::new(
            HttpServerState {
                handler: self.handler.clone(),
                service_key: self.config.service_key.clone(),
                trust_loopback: self.config.trust_loopback,
            },
            self.config.host.clone(),
            self.config.port,
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut http_task = tokio::spawn(async move { http_server.start(shutdown_rx).await });

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("❌ 无法监听退出信号: {}", e);
                }
                info!("🛑 收到退出信号");
            }
            joined = &mut http_task => {
                let message = match joined {
                    Ok(Ok(())) => "HTTP 服务器意外退出".to_string(),
                    Ok(Err(e)) => format!("HTTP 服务器启动失败: {}", e),
                    Err(e) => format!("HTTP 服务器任务异常: {}", e),
                };
                self.stop().await;
                return Err(ServerError::Internal(message));
            }
        }

        self.stop().await;
        if let Err(e) = http_task.await {
            warn!("⚠️ HTTP 服务器任务异常退出: {}", e);
        }
        Ok(())
    }

    /// 停止后台任务并关闭 iOS 连接
    pub async fn stop(&self) {
        info!("🛑 停止推送服务器...");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("⚠️ 后台任务异常退出: {}", e);
            }
        }

        self.apns.shutdown().await;
        info!("✅ 推送服务器已停止");
    }

    /// 启动 feedback 轮询和日志订阅
    fn start_background_tasks(&self) {
        let push = &self.config.push;

        let poller = FeedbackPoller::new(
            self.apns.clone(),
            self.feedback.clone(),
            push.feedback_interval(),
            push.batch_feedback,
        );
        let poller_task = poller.spawn(self.shutdown_tx.subscribe());

        // 默认订阅者：记录每个失效 Token，宿主可以另行订阅做清理
        let mut events = self.feedback.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let logger_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(record) => info!(
                            "[FEEDBACK] Invalid iOS token: token={}, invalidated_at={}",
                            record.token, record.invalidated_at
                        ),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        self.tasks.lock().extend([poller_task, logger_task]);
        info!(
            "✅ Feedback 轮询已启动（间隔 {} 秒）",
            push.feedback_interval_secs
        );
    }

    /// 显示配置信息
    fn show_config_info(&self) {
        let push = &self.config.push;
        info!("📊 服务器配置信息:");
        info!("  - 监听地址: {}:{}", self.config.host, self.config.port);
        info!("  - 仅内部调用: {}", push.internal_only);
        info!("  - 信任回环地址: {}", self.config.trust_loopback);
        info!("  - Android 通道: {}", push.android_enabled());
        info!("  - APNs 网关: {}", push.apn_gateway);
        info!("  - 发送超时: {}秒", push.send_timeout_secs);
        info!("  - Feedback 间隔: {}秒", push.feedback_interval_secs);
    }
}
