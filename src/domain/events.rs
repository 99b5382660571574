use crate::domain::value_objects::PayProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 支付事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "payment.success")]
    PaymentSuccess,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "refund.success")]
    RefundSuccess,
    #[serde(rename = "refund.failed")]
    RefundFailed,
    #[serde(rename = "subscription.renewed")]
    SubscriptionRenewed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentSuccess => "payment.success",
            EventType::PaymentFailed => "payment.failed",
            EventType::RefundSuccess => "refund.success",
            EventType::RefundFailed => "refund.failed",
            EventType::SubscriptionRenewed => "subscription.renewed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 支付事件
///
/// 只存在于派发期间，不落库；事件ID每次发布时新生成。
/// 订单无法匹配时 user_id 为空串，监控类订阅者仍可观测到该通知。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub provider: PayProvider,
    pub order_id: String,
    pub user_id: String,
    /// 提供方/来源相关的附加载荷
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn new(
        event_type: EventType,
        provider: PayProvider,
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            provider,
            order_id: order_id.into(),
            user_id: user_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}
