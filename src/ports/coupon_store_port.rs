use crate::domain::coupon::{Coupon, CouponUsage};
use crate::domain::errors::DomainResult;
use async_trait::async_trait;

/// 优惠券存储端口接口。
/// 券定义是只读业务配置，本服务只读取并记录核销。
#[async_trait]
pub trait CouponStorePort: Send + Sync {
    async fn find_by_code(&self, code: &str) -> DomainResult<Option<Coupon>>;

    /// 读取当前使用情况快照
    async fn usage(&self, code: &str, user_id: &str) -> DomainResult<CouponUsage>;

    /// 记录一次核销
    async fn record_redemption(&self, code: &str, user_id: &str, order_id: &str)
        -> DomainResult<()>;
}
