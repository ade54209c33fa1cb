//! 订阅类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::operation::Row;

/// 订阅者标识（例如一个 WebSocket 客户端）
pub type SubscriberId = String;

/// 订阅标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SubscriptionId {
    type Err = crate::error::LiveQueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<uuid::Uuid>()
            .map(SubscriptionId)
            .map_err(|e| crate::quick_error!(validation, "subscription_id", e))
    }
}

/// 订阅生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Cancelled,
}

/// 推送给订阅者的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    /// 一次轮询的结果
    Update {
        subscription_id: SubscriptionId,
        timestamp: DateTime<Utc>,
        rows: Vec<Row>,
    },
    /// 一次轮询失败，下一个周期继续
    Error {
        subscription_id: SubscriptionId,
        kind: String,
        cause: String,
    },
}

impl SubscriptionEvent {
    /// 事件所属的订阅
    pub fn subscription_id(&self) -> SubscriptionId {
        match self {
            SubscriptionEvent::Update { subscription_id, .. }
            | SubscriptionEvent::Error { subscription_id, .. } => *subscription_id,
        }
    }
}

/// 订阅者已断开，无法再投递
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("订阅者已断开")]
pub struct SinkClosed;

/// 订阅事件的接收端
///
/// 投递必须立即返回；返回 `SinkClosed` 时对应订阅会被自动取消
pub trait SubscriptionSink: Send + Sync + 'static {
    fn deliver(&self, event: SubscriptionEvent) -> Result<(), SinkClosed>;
}

impl SubscriptionSink for mpsc::UnboundedSender<SubscriptionEvent> {
    fn deliver(&self, event: SubscriptionEvent) -> Result<(), SinkClosed> {
        self.send(event).map_err(|_| SinkClosed)
    }
}

impl SubscriptionSink for mpsc::Sender<SubscriptionEvent> {
    fn deliver(&self, event: SubscriptionEvent) -> Result<(), SinkClosed> {
        match self.try_send(event) {
            Ok(()) => Ok(()),
            // 订阅者处理不过来时丢弃本次结果，下个周期还会推送
            Err(mpsc::error::TrySendError::Full(event)) => {
                rat_logger::warn!(
                    "订阅者队列已满，丢弃本次推送: 订阅={}",
                    event.subscription_id()
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkClosed),
        }
    }
}

/// 订阅快照
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub subscriber: SubscriberId,
    pub target: String,
    pub interval_ms: u64,
    pub created_at: DateTime<Utc>,
}
