use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{Result, ServerError};
use crate::push::provider::provider_trait::{AndroidChannel, FeedbackSource, IosChannel};
use crate::push::types::{
    AndroidMessage, DeliveryReport, DeviceResult, DeviceToken, FeedbackRecord, IosNotification,
};

/// Mock Provider（用于测试和本地调试）
///
/// 不调用真实网关，只记录收到的消息。Android 默认对每个设备返回成功，
/// 也可以预设一个错误；feedback 由调用方预先塞入。
#[derive(Default)]
pub struct MockProvider {
    android_calls: Mutex<Vec<(AndroidMessage, Vec<String>)>>,
    ios_calls: Mutex<Vec<(IosNotification, DeviceToken)>>,
    android_error: Mutex<Option<ServerError>>,
    ios_error: Mutex<Option<ServerError>>,
    feedback: Mutex<Vec<Result<Vec<FeedbackRecord>>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 Android 发送都返回该错误
    pub fn fail_android_with(&self, error: ServerError) {
        *self.android_error.lock() = Some(error);
    }

    /// 之后的 iOS 提交都返回该错误
    pub fn fail_ios_with(&self, error: ServerError) {
        *self.ios_error.lock() = Some(error);
    }

    /// 预设下一次 feedback 查询的结果，按先进先出依次返回
    pub fn queue_feedback(&self, cycle: Result<Vec<FeedbackRecord>>) {
        self.feedback.lock().push(cycle);
    }

    pub fn android_calls(&self) -> Vec<(AndroidMessage, Vec<String>)> {
        self.android_calls.lock().clone()
    }

    pub fn ios_calls(&self) -> Vec<(IosNotification, DeviceToken)> {
        self.ios_calls.lock().clone()
    }
}

#[async_trait]
impl AndroidChannel for MockProvider {
    async fn send(&self, message: &AndroidMessage, targets: &[String]) -> Result<DeliveryReport> {
        info!(
            "[MOCK PUSH] Android: title={}, message={}, ttl={}, devices={:?}",
            message.title, message.message, message.time_to_live, targets
        );
        self.android_calls
            .lock()
            .push((message.clone(), targets.to_vec()));

        if let Some(error) = self.android_error.lock().clone() {
            return Err(error);
        }

        let mut report = DeliveryReport::default();
        for (i, device_id) in targets.iter().enumerate() {
            report.record(
                device_id,
                DeviceResult::Delivered {
                    message_id: format!("mock-{}", i),
                },
            );
        }
        report.recount();
        Ok(report)
    }
}

#[async_trait]
impl IosChannel for MockProvider {
    async fn send(&self, notification: IosNotification, target: DeviceToken) -> Result<()> {
        info!(
            "[MOCK PUSH] iOS: token={}, alert={}, badge={}",
            target, notification.alert, notification.badge
        );
        if let Some(error) = self.ios_error.lock().clone() {
            return Err(error);
        }
        self.ios_calls.lock().push((notification, target));
        Ok(())
    }
}

#[async_trait]
impl FeedbackSource for MockProvider {
    async fn fetch_feedback(&self) -> Result<Vec<FeedbackRecord>> {
        let mut queued = self.feedback.lock();
        if queued.is_empty() {
            Ok(Vec::new())
        } else {
            queued.remove(0)
        }
    }
}
