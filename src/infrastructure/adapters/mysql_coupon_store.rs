use crate::domain::coupon::{Coupon, CouponUsage, DiscountType};
use crate::domain::errors::DomainResult;
use crate::domain::value_objects::OrderType;
use crate::ports::CouponStorePort;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};
use std::sync::Arc;
use tracing::debug;

/// MySQL 优惠券存储实现。券定义只读，本服务仅追加核销记录
#[derive(Clone)]
pub struct MySqlCouponStore {
    pool: Arc<Pool<MySql>>,
}

impl MySqlCouponStore {
    pub fn new(pool: Arc<Pool<MySql>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CouponStorePort for MySqlCouponStore {
    async fn find_by_code(&self, code: &str) -> DomainResult<Option<Coupon>> {
        let query = r#"
            SELECT code, active, discount_type, discount_value, max_discount,
                   min_amount, starts_at, expires_at, total_usage_limit,
                   per_user_limit, applicable_types
            FROM coupons
            WHERE code = ?
        "#;
        let row = sqlx::query_as::<_, CouponRow>(query)
            .bind(code)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row.map(|r| r.into_coupon()))
    }

    async fn usage(&self, code: &str, user_id: &str) -> DomainResult<CouponUsage> {
        let (total_used,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM coupon_redemptions WHERE code = ?")
                .bind(code)
                .fetch_one(self.pool.as_ref())
                .await?;
        let (used_by_user,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM coupon_redemptions WHERE code = ? AND user_id = ?",
        )
        .bind(code)
        .bind(user_id)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(CouponUsage {
            total_used: total_used as u32,
            used_by_user: used_by_user as u32,
        })
    }

    async fn record_redemption(
        &self,
        code: &str,
        user_id: &str,
        order_id: &str,
    ) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO coupon_redemptions (code, user_id, order_id, redeemed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(code)
        .bind(user_id)
        .bind(order_id)
        .bind(Utc::now())
        .execute(self.pool.as_ref())
        .await?;

        debug!(coupon = %code, order_id = %order_id, "coupon redemption recorded");
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CouponRow {
    code: String,
    active: bool,
    discount_type: String,
    discount_value: i64,
    max_discount: Option<i64>,
    min_amount: i64,
    starts_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    total_usage_limit: Option<u32>,
    per_user_limit: Option<u32>,
    /// JSON 数组，如 ["subscription","skill"]；NULL 表示不限
    applicable_types: Option<sqlx::types::Json<Vec<String>>>,
}

impl CouponRow {
    fn into_coupon(self) -> Coupon {
        let discount_type = match self.discount_type.as_str() {
            "percentage" => DiscountType::Percentage,
            "fixed" => DiscountType::Fixed,
            other => panic!("Invalid discount type: {}", other),
        };
        let applicable_types = self.applicable_types.map(|json| {
            json.0
                .iter()
                .filter_map(|s| OrderType::parse(s))
                .collect::<Vec<_>>()
        });

        Coupon {
            code: self.code,
            active: self.active,
            discount_type,
            discount_value: self.discount_value,
            max_discount: self.max_discount,
            min_amount: self.min_amount,
            starts_at: self.starts_at,
            expires_at: self.expires_at,
            total_usage_limit: self.total_usage_limit,
            per_user_limit: self.per_user_limit,
            applicable_types,
        }
    }
}
