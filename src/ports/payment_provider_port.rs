use crate::domain::errors::DomainResult;
use crate::domain::value_objects::{
    Money, PayProvider, ProviderNotification, ProviderTradeState,
};
use crate::domain::PaymentOrder;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 创建支付后返回的收银台信息。
/// 微信 Native 填 qr_code，支付宝页面支付填 pay_url，
/// pay_params 为客户端自行提交/调起 SDK 所需的已签名参数。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCheckout {
    pub qr_code: Option<String>,
    pub pay_url: Option<String>,
    pub pay_params: Option<serde_json::Value>,
}

/// 查询订单的规范化结果
#[derive(Debug, Clone)]
pub struct ProviderOrderStatus {
    pub state: ProviderTradeState,
    /// 提供方原始状态字符串，用于日志与失败原因
    pub raw_state: String,
    pub external_order_id: Option<String>,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// 发起退款的参数
#[derive(Debug, Clone)]
pub struct ProviderRefundRequest {
    pub order_id: String,
    /// 商户侧退款单号
    pub refund_id: String,
    /// 订单原始金额
    pub total: Money,
    /// 本次退款金额
    pub refund: Money,
    pub reason: Option<String>,
}

/// 提供方受理退款的回执
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRefundReceipt {
    pub refund_id: String,
    pub external_refund_id: Option<String>,
}

/// 原始回调载荷：HTTP 头与报文体，由 API 层透传
#[derive(Debug, Clone, Default)]
pub struct RawNotification {
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawNotification {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// 支付提供方端口接口
#[async_trait]
pub trait PaymentProviderPort: Send + Sync {
    fn provider(&self) -> PayProvider;

    /// 在提供方创建支付单，返回收银台信息
    async fn create_order(&self, order: &PaymentOrder) -> DomainResult<ProviderCheckout>;

    /// 查询提供方订单状态
    async fn query_order(&self, order_id: &str) -> DomainResult<ProviderOrderStatus>;

    /// 关闭提供方订单。返回 false 表示提供方业务层拒绝关闭
    async fn close_order(&self, order_id: &str) -> DomainResult<bool>;

    /// 发起退款
    async fn create_refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> DomainResult<ProviderRefundReceipt>;

    /// 验签并解析回调通知，产出规范化结果。
    /// 验签失败必须返回错误，不得继续解析业务数据。
    async fn verify_and_parse_notification(
        &self,
        raw: &RawNotification,
    ) -> DomainResult<ProviderNotification>;
}
