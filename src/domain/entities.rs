use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::value_objects::{
    Currency, Money, OrderStatus, OrderType, PayProvider, TransactionStatus, TransactionType,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 支付订单实体
///
/// 状态只通过带守卫的转换方法变更，前置状态不满足时方法不做任何
/// 修改并返回 false，调用方据此跳过流水记录等副作用。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOrder {
    /// 商户订单号（对提供方即 out_trade_no）
    pub id: String,

    /// 用户ID
    pub user_id: String,

    /// 订单类型
    pub order_type: OrderType,

    /// 应付金额
    pub amount: Money,

    /// 币种
    pub currency: Currency,

    /// 订单状态
    pub status: OrderStatus,

    /// 支付提供方
    pub provider: PayProvider,

    /// 提供方交易号（支付成功后回填）
    pub external_order_id: Option<String>,

    /// 商品描述
    pub description: String,

    /// 支付完成时间
    pub paid_at: Option<DateTime<Utc>>,

    /// 累计退款金额
    pub refund_amount: Money,

    /// 全额退款完成时间
    pub refunded_at: Option<DateTime<Utc>>,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl PaymentOrder {
    /// 创建新的支付订单
    pub fn new(
        id: String,
        user_id: String,
        order_type: OrderType,
        amount: Money,
        currency: Currency,
        provider: PayProvider,
        description: String,
    ) -> DomainResult<Self> {
        if amount.to_cents() <= 0 {
            return Err(DomainError::InvalidAmount(
                "Amount must be greater than 0".to_string(),
            ));
        }

        if id.is_empty() || id.len() > 64 {
            return Err(DomainError::ValidationError(
                "Order id must be 1-64 characters".to_string(),
            ));
        }

        if user_id.is_empty() {
            return Err(DomainError::ValidationError(
                "User id must not be empty".to_string(),
            ));
        }

        if description.is_empty() || description.len() > 127 {
            return Err(DomainError::ValidationError(
                "Description must be 1-127 characters".to_string(),
            ));
        }

        let now = Utc::now();

        Ok(Self {
            id,
            user_id,
            order_type,
            amount,
            currency,
            status: OrderStatus::Pending,
            provider,
            external_order_id: None,
            description,
            paid_at: None,
            refund_amount: Money::ZERO,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// pending → paid。前置状态不满足时为 no-op
    pub fn mark_paid(&mut self, external_order_id: String, paid_at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(OrderStatus::Paid) {
            return false;
        }
        self.status = OrderStatus::Paid;
        self.external_order_id = Some(external_order_id);
        self.paid_at = Some(paid_at);
        self.updated_at = Utc::now();
        true
    }

    /// pending → failed。前置状态不满足时为 no-op
    pub fn mark_failed(&mut self) -> bool {
        if !self.status.can_transition_to(OrderStatus::Failed) {
            return false;
        }
        self.status = OrderStatus::Failed;
        self.updated_at = Utc::now();
        true
    }

    /// pending → canceled。前置状态不满足时为 no-op
    pub fn mark_canceled(&mut self) -> bool {
        if !self.status.can_transition_to(OrderStatus::Canceled) {
            return false;
        }
        self.status = OrderStatus::Canceled;
        self.updated_at = Utc::now();
        true
    }

    /// 记录一笔退款。只在 paid 状态下生效；退款金额累计，
    /// 超出剩余可退金额的部分被截断；累计达到订单金额时
    /// 转入 refunded，部分退款订单保持 paid。
    pub fn apply_refund(&mut self, refund: Money, now: DateTime<Utc>) -> bool {
        if self.status != OrderStatus::Paid {
            return false;
        }
        let remaining = self.amount.to_cents() - self.refund_amount.to_cents();
        let applied = refund.to_cents().clamp(0, remaining);
        self.refund_amount = Money::from_cents(self.refund_amount.to_cents() + applied);
        if self.refund_amount >= self.amount {
            self.status = OrderStatus::Refunded;
            self.refunded_at = Some(now);
        }
        self.updated_at = Utc::now();
        true
    }

    /// 剩余可退金额
    pub fn refundable(&self) -> Money {
        Money::from_cents(self.amount.to_cents() - self.refund_amount.to_cents())
    }

    /// 检查是否可以支付
    pub fn can_pay(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

/// 资金流水：一次资金变动的不可变审计记录，写入后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub order_id: String,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Money,
    pub external_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    fn new(
        order_id: &str,
        tx_type: TransactionType,
        status: TransactionStatus,
        amount: Money,
        external_transaction_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            tx_type,
            status,
            amount,
            external_transaction_id,
            created_at: Utc::now(),
        }
    }

    pub fn payment_success(order_id: &str, amount: Money, external_id: Option<String>) -> Self {
        Self::new(
            order_id,
            TransactionType::Payment,
            TransactionStatus::Success,
            amount,
            external_id,
        )
    }

    pub fn payment_failed(order_id: &str, amount: Money) -> Self {
        Self::new(
            order_id,
            TransactionType::Payment,
            TransactionStatus::Failed,
            amount,
            None,
        )
    }

    pub fn refund_success(order_id: &str, amount: Money, refund_id: Option<String>) -> Self {
        Self::new(
            order_id,
            TransactionType::Refund,
            TransactionStatus::Success,
            amount,
            refund_id,
        )
    }
}

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Expired,
}

/// 订阅实体（续费调度的扫描对象）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    /// 续费价格
    pub amount: Money,
    pub currency: Currency,
    /// 续费走的支付提供方
    pub provider: PayProvider,
    /// 订阅周期天数
    pub period_days: i64,
    pub current_period_end: DateTime<Utc>,
    pub auto_renew: bool,
}

/// 续费任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalTaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Retrying,
}

/// 续费任务
///
/// 由调度器创建并推进，success 或重试耗尽后的 failed 为终态。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalTask {
    pub id: String,
    pub subscription_id: String,
    pub status: RenewalTaskStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// 成功续费产生的订单号
    pub order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RenewalTask {
    pub fn new(subscription_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            subscription_id: subscription_id.to_string(),
            status: RenewalTaskStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 任务是否仍在推进中
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status,
            RenewalTaskStatus::Pending | RenewalTaskStatus::Processing | RenewalTaskStatus::Retrying
        )
    }

    /// 到达执行时间且未在执行
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            RenewalTaskStatus::Pending | RenewalTaskStatus::Retrying
        ) && self.next_attempt_at <= now
    }

    pub fn mark_processing(&mut self) {
        self.status = RenewalTaskStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn mark_success(&mut self, order_id: String) {
        self.status = RenewalTaskStatus::Success;
        self.order_id = Some(order_id);
        self.updated_at = Utc::now();
    }

    /// 记录一次失败。未达上限时按指数退避转入 retrying 并返回 true；
    /// 重试耗尽时转入 failed 并返回 false，不再调度。
    pub fn record_failure(&mut self, error: String, max_retries: u32, base_delay: Duration) -> bool {
        self.attempts += 1;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
        if self.attempts >= max_retries {
            self.status = RenewalTaskStatus::Failed;
            return false;
        }
        self.status = RenewalTaskStatus::Retrying;
        self.next_attempt_at = Utc::now() + Self::backoff_delay(self.attempts, base_delay);
        true
    }

    /// 指数退避，上限 1 小时
    fn backoff_delay(attempts: u32, base: Duration) -> Duration {
        let factor = 2_i64.checked_pow(attempts.saturating_sub(1)).unwrap_or(i64::MAX);
        let delay = base
            .num_seconds()
            .saturating_mul(factor)
            .clamp(0, 3600);
        Duration::seconds(delay)
    }
}
