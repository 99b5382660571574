use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::{DomainError, DomainResult};

/// 支付提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayProvider {
    /// 微信支付
    Wechat,
    /// 支付宝
    Alipay,
}

impl PayProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wechat" => Some(PayProvider::Wechat),
            "alipay" => Some(PayProvider::Alipay),
            _ => None,
        }
    }
}

impl fmt::Display for PayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayProvider::Wechat => write!(f, "wechat"),
            PayProvider::Alipay => write!(f, "alipay"),
        }
    }
}

/// 订单类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// 订阅套餐
    Subscription,
    /// 技能购买
    Skill,
    /// 代币充值
    Tokens,
    /// 增值服务
    Addon,
}

impl OrderType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(OrderType::Subscription),
            "skill" => Some(OrderType::Skill),
            "tokens" => Some(OrderType::Tokens),
            "addon" => Some(OrderType::Addon),
            _ => None,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Subscription => write!(f, "subscription"),
            OrderType::Skill => write!(f, "skill"),
            OrderType::Tokens => write!(f, "tokens"),
            OrderType::Addon => write!(f, "addon"),
        }
    }
}

/// 币种
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "CNY")]
    Cny,
    #[serde(rename = "USD")]
    Usd,
}

impl Currency {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CNY" => Some(Currency::Cny),
            "USD" => Some(Currency::Usd),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Cny => write!(f, "CNY"),
            Currency::Usd => write!(f, "USD"),
        }
    }
}

/// 订单状态
///
/// 状态机：pending → paid → refunded；pending → failed；pending → canceled。
/// 其余任何转换都不允许，调用方以 no-op 处理而非报错，
/// 以此保证回调的 at-least-once 重放安全。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// 待支付
    Pending,
    /// 已支付
    Paid,
    /// 支付失败
    Failed,
    /// 已退款
    Refunded,
    /// 已取消
    Canceled,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "failed" => Some(OrderStatus::Failed),
            "refunded" => Some(OrderStatus::Refunded),
            "canceled" => Some(OrderStatus::Canceled),
            _ => None,
        }
    }

    /// 判断到目标状态的转换是否被状态机允许
    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        matches!(
            (self, to),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::Pending, OrderStatus::Canceled)
                | (OrderStatus::Paid, OrderStatus::Refunded)
        )
    }

    /// 终态（paid 不是终态，还可以退款）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Failed | OrderStatus::Refunded | OrderStatus::Canceled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Paid => write!(f, "paid"),
            OrderStatus::Failed => write!(f, "failed"),
            OrderStatus::Refunded => write!(f, "refunded"),
            OrderStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// 资金流水类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    Refund,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Payment => write!(f, "payment"),
            TransactionType::Refund => write!(f, "refund"),
        }
    }
}

/// 资金流水结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Failed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Success => write!(f, "success"),
            TransactionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 货币金额（分为单位，避免浮点数精度问题）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money {
    /// 金额（分）
    pub amount_cents: i64,
}

impl Money {
    pub const ZERO: Money = Money { amount_cents: 0 };

    /// 创建新的金额对象（单位：元）
    pub fn from_yuan(amount: i64) -> Self {
        Self {
            amount_cents: amount * 100,
        }
    }

    /// 创建新的金额对象（单位：分）
    pub fn from_cents(cents: i64) -> Self {
        Self {
            amount_cents: cents,
        }
    }

    /// 将十进制元字符串（如支付宝 total_amount "88.88"）转换为分。
    /// 转换只发生在适配器边界，round(yuan * 100)，下游一律使用分。
    pub fn from_yuan_str(s: &str) -> DomainResult<Self> {
        let s = s.trim();
        if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
            return Err(DomainError::InvalidAmount(format!(
                "not a decimal yuan amount: {:?}",
                s
            )));
        }

        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DomainError::InvalidAmount(format!(
                "not a decimal yuan amount: {:?}",
                s
            )));
        }
        if !frac_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(DomainError::InvalidAmount(format!(
                "invalid fraction digits in amount: {:?}",
                s
            )));
        }

        let yuan: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| {
                DomainError::InvalidAmount(format!("invalid integer part in amount: {:?}", s))
            })?
        };

        let digit = |i: usize| -> i64 {
            frac_part
                .as_bytes()
                .get(i)
                .map(|b| (b - b'0') as i64)
                .unwrap_or(0)
        };
        let mut cents = digit(0) * 10 + digit(1);
        // 第三位小数四舍五入
        if digit(2) >= 5 {
            cents += 1;
        }

        Ok(Self {
            amount_cents: yuan * 100 + cents,
        })
    }

    /// 转换为元
    pub fn to_yuan(&self) -> f64 {
        self.amount_cents as f64 / 100.0
    }

    /// 转换为十进制元字符串（支付宝接口要求的金额格式）
    pub fn to_yuan_string(&self) -> String {
        format!("{}.{:02}", self.amount_cents / 100, self.amount_cents % 100)
    }

    /// 转换为分
    pub fn to_cents(&self) -> i64 {
        self.amount_cents
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "¥{:.2}", self.to_yuan())
    }
}

/// 适配器验签、解析回调后产出的规范化结果。
///
/// 生命周期驱动只依赖此类型，不感知任何提供方私有报文结构。
#[derive(Debug, Clone)]
pub enum ProviderNotification {
    /// 支付成功
    PaymentSucceeded {
        provider: PayProvider,
        order_id: String,
        external_order_id: String,
        amount: Money,
        paid_at: DateTime<Utc>,
        /// 提供方原始字段，随事件透传给订阅者
        extra: serde_json::Value,
    },
    /// 支付终局失败（关闭/撤销/支付错误）
    PaymentFailed {
        provider: PayProvider,
        order_id: String,
        reason: String,
    },
    /// 退款成功
    RefundSucceeded {
        provider: PayProvider,
        order_id: String,
        refund_id: String,
        refund_amount: Money,
    },
    /// 退款失败
    RefundFailed {
        provider: PayProvider,
        order_id: String,
        reason: String,
    },
    /// 中间状态通知（如 USERPAYING/NOTPAY），无需驱动状态机
    Ignored {
        provider: PayProvider,
        order_id: Option<String>,
        state: String,
    },
}

/// 查询订单时提供方返回的规范化交易状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderTradeState {
    /// 已支付
    Success,
    /// 等待支付
    Pending,
    /// 已关闭/撤销
    Closed,
    /// 支付失败
    Failed,
}
