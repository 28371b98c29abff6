use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::infra::metrics;
use crate::push::provider::FeedbackSource;
use crate::push::types::FeedbackRecord;

/// Feedback 事件接收方
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// 每个失效 Token 调用一次，不需要确认
    async fn emit(&self, record: FeedbackRecord);
}

/// Feedback 事件总线
///
/// 每个订阅者一条有界队列。`emit` 会等待队列腾出空间，
/// 订阅者处理慢时轮询随之放慢，不会丢事件。订阅者断开后自动移除，
/// 没有订阅者时事件直接丢弃。
pub struct FeedbackHub {
    subscribers: Mutex<Vec<mpsc::Sender<FeedbackRecord>>>,
    capacity: usize,
}

impl FeedbackHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<FeedbackRecord> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.is_closed());
        subscribers.len()
    }
}

impl Default for FeedbackHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl FeedbackSink for FeedbackHub {
    async fn emit(&self, record: FeedbackRecord) {
        let subscribers = self.subscribers.lock().clone();
        if subscribers.is_empty() {
            debug!("[FEEDBACK] No subscriber, event dropped");
            return;
        }

        let mut closed = false;
        for subscriber in &subscribers {
            if subscriber.send(record.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            debug!("[FEEDBACK] Removing closed subscriber(s)");
            self.subscribers.lock().retain(|s| !s.is_closed());
        }
    }
}

/// Feedback Poller（后台轮询任务）
///
/// 按固定间隔向网关查询失效 Token，每个 Token 发出一个事件。
/// 单次查询失败只记日志，下一轮照常进行。
pub struct FeedbackPoller {
    source: Arc<dyn FeedbackSource>,
    sink: Arc<dyn FeedbackSink>,
    interval: Duration,
    batch: bool,
}

impl FeedbackPoller {
    pub fn new(
        source: Arc<dyn FeedbackSource>,
        sink: Arc<dyn FeedbackSink>,
        interval: Duration,
        batch: bool,
    ) -> Self {
        Self {
            source,
            sink,
            interval,
            batch,
        }
    }

    /// 执行一轮查询，返回发出的事件数
    pub async fn poll_once(&self) -> Result<usize> {
        let records = self.source.fetch_feedback().await?;
        let records = if self.batch {
            coalesce(records)
        } else {
            records
        };

        let count = records.len();
        for record in records {
            debug!(
                "[FEEDBACK] Token invalidated: token={}, at={}",
                record.token, record.invalidated_at
            );
            self.sink.emit(record).await;
        }

        if count > 0 {
            info!("[FEEDBACK] Emitted {} feedback event(s)", count);
            metrics::record_feedback_events(count);
        }
        Ok(count)
    }

    /// 启动后台任务，`shutdown` 变为 true 时退出
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "[FEEDBACK] Poller started: interval={}s, batch={}",
            self.interval.as_secs(),
            self.batch
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }

            // 订阅者处理慢时本轮可能阻塞，关闭信号同样可以打断
            tokio::select! {
                result = self.poll_once() => {
                    if let Err(e) = result {
                        warn!("[FEEDBACK] Poll cycle failed: {}", e);
                        metrics::record_feedback_poll_failure();
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }

        info!("[FEEDBACK] Poller stopped");
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// 同一轮里重复出现的 Token 只保留最新的一条，保持首次出现的顺序
fn coalesce(records: Vec<FeedbackRecord>) -> Vec<FeedbackRecord> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<FeedbackRecord> = Vec::with_capacity(records.len());

    for record in records {
        match index.get(&record.token) {
            Some(&i) => {
                if record.invalidated_at > merged[i].invalidated_at {
                    merged[i] = record;
                }
            }
            None => {
                index.insert(record.token.clone(), merged.len());
                merged.push(record);
            }
        }
    }
    merged
}
