use crate::domain::errors::DomainResult;
use crate::domain::value_objects::{Money, OrderStatus};
use crate::domain::{PaymentOrder, Transaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 状态转换附带的元数据
#[derive(Debug, Clone, Default)]
pub struct StatusMetadata {
    pub external_order_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// 订单存储端口接口
///
/// update_status / apply_refund 必须是"当前状态满足前置条件才更新"
/// 的原子操作（compare-and-swap 语义）。先读后写会重新引入重复
/// 处理竞态，破坏回调幂等性。
#[async_trait]
pub trait OrderStorePort: Send + Sync {
    /// 保存新订单
    async fn create(&self, order: &PaymentOrder) -> DomainResult<()>;

    /// 根据订单号查找
    async fn find_by_id(&self, order_id: &str) -> DomainResult<Option<PaymentOrder>>;

    /// 带前置状态守卫的原子状态更新。
    /// 订单不存在或当前状态不在 from 中时返回 None 且无任何副作用；
    /// 更新成功时返回更新后的订单。
    async fn update_status(
        &self,
        order_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
        meta: StatusMetadata,
    ) -> DomainResult<Option<PaymentOrder>>;

    /// 原子地累计一笔退款。只对 paid 状态的订单生效；
    /// 累计金额覆盖订单金额时同时转入 refunded。
    /// 不满足前置条件时返回 None 且无副作用。
    async fn apply_refund(
        &self,
        order_id: &str,
        refund: Money,
        refunded_at: DateTime<Utc>,
    ) -> DomainResult<Option<PaymentOrder>>;

    /// 追加一条不可变资金流水
    async fn record_transaction(&self, tx: &Transaction) -> DomainResult<()>;
}
