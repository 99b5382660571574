use crate::domain::errors::DomainResult;
use crate::domain::Subscription;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 订阅存储端口接口
#[async_trait]
pub trait SubscriptionStorePort: Send + Sync {
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<Subscription>>;

    /// 查找在给定时刻前到期、开启自动续费的活跃订阅
    async fn find_expiring(&self, before: DateTime<Utc>) -> DomainResult<Vec<Subscription>>;

    /// 续费成功后顺延订阅周期
    async fn extend_period(&self, id: &str, new_period_end: DateTime<Utc>) -> DomainResult<()>;
}
