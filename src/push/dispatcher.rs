use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::error::{ErrorCode, Result, ServerError};
use crate::infra::metrics;
use crate::push::planner::PushPlanner;
use crate::push::provider::{AndroidChannel, IosChannel};
use crate::push::types::{
    CallerContext, DeliveryReport, DispatchOutcome, DispatchRequest, DispatchTargets,
    IosSubmission, IosSubmissionFailure, NotificationRequest, PlatformResult,
};

/// Dispatch Handler（推送分发入口）
///
/// 一次请求的流程：
/// 1. 访问控制（`internal_only` 时拒绝外部调用方，不触发任何通道调用）
/// 2. 把请求校验为 [`DispatchRequest`]
/// 3. Android / iOS 两条路径并发执行，结果汇总为 [`DispatchOutcome`]
///
/// 通道未配置时对应路径报 `ServiceUnavailable`，不影响另一条路径。
pub struct DispatchHandler {
    config: Arc<PushConfig>,
    android: Option<Arc<dyn AndroidChannel>>,
    ios: Option<Arc<dyn IosChannel>>,
}

impl DispatchHandler {
    pub fn new(
        config: Arc<PushConfig>,
        android: Option<Arc<dyn AndroidChannel>>,
        ios: Option<Arc<dyn IosChannel>>,
    ) -> Self {
        Self {
            config,
            android,
            ios,
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    /// 分发一次推送请求
    ///
    /// 只有 Android 目标且发送失败时返回该错误；同时包含两个平台时，
    /// Android 的错误放在 `outcome.android` 里。
    pub async fn dispatch(
        &self,
        request: NotificationRequest,
        caller: CallerContext,
    ) -> Result<DispatchOutcome> {
        if self.config.internal_only && !caller.internal {
            warn!("[DISPATCH] Rejected request from external caller");
            metrics::record_access_denied();
            return Err(ServerError::PermissionDenied(
                "push notifications are restricted to internal callers".to_string(),
            ));
        }

        let request = DispatchRequest::try_from(request)?;
        let kind = match &request.targets {
            DispatchTargets::None => "none",
            DispatchTargets::Android(_) => "android",
            DispatchTargets::Ios(_) => "ios",
            DispatchTargets::Both { .. } => "both",
        };
        metrics::record_dispatch(kind);

        if request.targets.is_empty() {
            debug!("[DISPATCH] No targets, nothing to send");
            return Ok(DispatchOutcome::default());
        }

        let (android, ios) = tokio::join!(
            self.dispatch_android(&request),
            self.dispatch_ios(&request)
        );

        if let (Some(Err(e)), None) = (&android, &ios) {
            return Err(e.clone());
        }

        Ok(DispatchOutcome {
            android: android.map(PlatformResult::from),
            ios,
        })
    }

    async fn dispatch_android(&self, request: &DispatchRequest) -> Option<Result<DeliveryReport>> {
        let targets = request.targets.android()?;
        let Some(channel) = &self.android else {
            warn!("[DISPATCH] Android targets present but no Android channel configured");
            return Some(Err(ServerError::ServiceUnavailable(
                "Android channel is not configured".to_string(),
            )));
        };

        let message = PushPlanner::new(&self.config).android_message(request);
        info!("[DISPATCH] Sending to {} Android device(s)", targets.len());

        let result = channel.send(&message, targets).await;
        match &result {
            Ok(report) => info!(
                "[DISPATCH] Android done: success={}, failure={}, canonical_ids={}",
                report.success, report.failure, report.canonical_ids
            ),
            Err(e) => warn!("[DISPATCH] Android send failed: {}", e),
        }
        Some(result)
    }

    async fn dispatch_ios(&self, request: &DispatchRequest) -> Option<IosSubmission> {
        let tokens = request.targets.ios()?;
        let mut submission = IosSubmission::default();

        for rejected in &request.rejected_tokens {
            warn!("[DISPATCH] iOS token rejected: {}", rejected.error);
            submission.failed.push(failure(&rejected.raw, &rejected.error));
        }
        if tokens.is_empty() {
            return Some(submission);
        }

        let Some(channel) = &self.ios else {
            warn!("[DISPATCH] iOS targets present but no iOS channel configured");
            let error = ServerError::ServiceUnavailable("iOS channel is not configured".to_string());
            for token in tokens {
                submission.failed.push(failure(token.as_str(), &error));
            }
            return Some(submission);
        };

        let notification = PushPlanner::new(&self.config).ios_notification(request);
        info!("[DISPATCH] Submitting to {} iOS device(s)", tokens.len());

        // 按列表顺序逐个入队，入队不等待网关结果
        for token in tokens {
            match channel.send(notification.clone(), token.clone()).await {
                Ok(()) => submission.submitted.push(token.to_string()),
                Err(e) => {
                    warn!("[DISPATCH] iOS submit failed: token={}, error={}", token, e);
                    submission.failed.push(failure(token.as_str(), &e));
                }
            }
        }
        Some(submission)
    }
}

fn failure(token: &str, error: &ServerError) -> IosSubmissionFailure {
    IosSubmissionFailure {
        token: token.to_string(),
        code: ErrorCode::from(error),
        message: error.to_string(),
    }
}
