use crate::domain::entities::{Subscription, SubscriptionStatus};
use crate::domain::errors::DomainResult;
use crate::domain::value_objects::{Currency, Money, PayProvider};
use crate::ports::SubscriptionStorePort;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};
use std::sync::Arc;
use tracing::debug;

/// MySQL 订阅存储实现
#[derive(Clone)]
pub struct MySqlSubscriptionStore {
    pool: Arc<Pool<MySql>>,
}

impl MySqlSubscriptionStore {
    pub fn new(pool: Arc<Pool<MySql>>) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, plan_id, status, amount_cents, currency,
           provider, period_days, current_period_end, auto_renew
    FROM subscriptions
"#;

#[async_trait]
impl SubscriptionStorePort for MySqlSubscriptionStore {
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<Subscription>> {
        let query = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row.map(|r| r.into_subscription()))
    }

    /// 临近到期、开启自动续费的活跃订阅
    async fn find_expiring(&self, before: DateTime<Utc>) -> DomainResult<Vec<Subscription>> {
        let query = format!(
            "{} WHERE status = 'active' AND auto_renew = 1 AND current_period_end <= ?",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(before)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows.into_iter().map(|r| r.into_subscription()).collect())
    }

    async fn extend_period(&self, id: &str, new_period_end: DateTime<Utc>) -> DomainResult<()> {
        let query = r#"
            UPDATE subscriptions
            SET current_period_end = ?, updated_at = ?
            WHERE id = ?
        "#;
        sqlx::query(query)
            .bind(new_period_end)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        debug!(subscription_id = %id, new_period_end = %new_period_end, "subscription period extended");
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    user_id: String,
    plan_id: String,
    status: String,
    amount_cents: i64,
    currency: String,
    provider: String,
    period_days: i64,
    current_period_end: DateTime<Utc>,
    auto_renew: bool,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Subscription {
        let status = match self.status.as_str() {
            "active" => SubscriptionStatus::Active,
            "canceled" => SubscriptionStatus::Canceled,
            "expired" => SubscriptionStatus::Expired,
            other => panic!("Invalid subscription status: {}", other),
        };
        let currency = Currency::parse(&self.currency)
            .unwrap_or_else(|| panic!("Invalid currency: {}", self.currency));
        let provider = PayProvider::parse(&self.provider)
            .unwrap_or_else(|| panic!("Invalid provider: {}", self.provider));

        Subscription {
            id: self.id,
            user_id: self.user_id,
            plan_id: self.plan_id,
            status,
            amount: Money::from_cents(self.amount_cents),
            currency,
            provider,
            period_days: self.period_days,
            current_period_end: self.current_period_end,
            auto_renew: self.auto_renew,
        }
    }
}
