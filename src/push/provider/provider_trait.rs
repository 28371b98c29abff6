use async_trait::async_trait;

use crate::error::Result;
use crate::push::types::{AndroidMessage, DeliveryReport, DeviceToken, FeedbackRecord, IosNotification};

/// Android 推送通道
///
/// 实现需要支持并发调用，重试由通道自己负责。
#[async_trait]
pub trait AndroidChannel: Send + Sync {
    /// 发送一条消息到一组设备，返回按设备 id 索引的投递报告
    async fn send(&self, message: &AndroidMessage, targets: &[String]) -> Result<DeliveryReport>;
}

/// iOS 推送通道
#[async_trait]
pub trait IosChannel: Send + Sync {
    /// 提交一条通知，返回 `Ok` 只表示已交给连接，不代表已送达
    async fn send(&self, notification: IosNotification, target: DeviceToken) -> Result<()>;
}

/// 失效 Token 的来源（网关的 feedback 通道）
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    /// 取出上次查询之后新失效的 Token
    async fn fetch_feedback(&self) -> Result<Vec<FeedbackRecord>>;
}
