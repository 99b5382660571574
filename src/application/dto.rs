use crate::domain::entities::{RenewalTask, RenewalTaskStatus};
use crate::domain::value_objects::{Currency, OrderType, PayProvider};
use crate::domain::PaymentOrder;
use crate::ports::ProviderCheckout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 创建支付请求
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    /// 商户订单号，不传则由服务生成
    pub order_id: Option<String>,

    /// 用户ID
    pub user_id: String,

    /// 订单类型
    pub order_type: OrderType,

    /// 应付金额（分）
    pub amount_cents: i64,

    /// 币种
    pub currency: Currency,

    /// 支付提供方
    pub provider: PayProvider,

    /// 商品描述
    pub description: String,

    /// 优惠券码
    pub coupon_code: Option<String>,
}

/// 支付响应
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub order_id: String,
    pub user_id: String,
    pub order_type: OrderType,

    /// 实付金额（分，已扣除折扣）
    pub amount_cents: i64,

    /// 折扣金额（分）
    pub discount_cents: i64,

    pub currency: Currency,
    pub provider: PayProvider,
    pub status: String,
    pub external_order_id: Option<String>,

    /// 收银台信息（创建时返回）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout: Option<ProviderCheckout>,

    pub paid_at: Option<DateTime<Utc>>,
    pub refund_amount_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl PaymentResponse {
    pub fn from_order(
        order: PaymentOrder,
        discount_cents: i64,
        checkout: Option<ProviderCheckout>,
    ) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            order_type: order.order_type,
            amount_cents: order.amount.to_cents(),
            discount_cents,
            currency: order.currency,
            provider: order.provider,
            status: order.status.to_string(),
            external_order_id: order.external_order_id,
            checkout,
            paid_at: order.paid_at,
            refund_amount_cents: order.refund_amount.to_cents(),
            created_at: order.created_at,
        }
    }
}

/// 发起退款请求
#[derive(Debug, Deserialize)]
pub struct CreateRefundRequest {
    /// 退款金额（分），不传则退剩余全部
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
}

/// 退款受理响应
#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub order_id: String,
    pub refund_id: String,
    pub refund_cents: i64,
}

/// 续费任务查询参数
#[derive(Debug, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<RenewalTaskStatus>,
    pub subscription_id: Option<String>,
}

/// 续费任务响应
#[derive(Debug, Serialize)]
pub struct RenewalTaskResponse {
    pub id: String,
    pub subscription_id: String,
    pub status: RenewalTaskStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub order_id: Option<String>,
}

impl From<RenewalTask> for RenewalTaskResponse {
    fn from(task: RenewalTask) -> Self {
        Self {
            id: task.id,
            subscription_id: task.subscription_id,
            status: task.status,
            attempts: task.attempts,
            next_attempt_at: task.next_attempt_at,
            last_error: task.last_error,
            order_id: task.order_id,
        }
    }
}

/// 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
