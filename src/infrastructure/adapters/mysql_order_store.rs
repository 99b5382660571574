use crate::domain::errors::DomainResult;
use crate::domain::value_objects::{Currency, Money, OrderStatus, OrderType, PayProvider};
use crate::domain::{PaymentOrder, Transaction};
use crate::ports::{OrderStorePort, StatusMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};
use std::sync::Arc;
use tracing::debug;

/// MySQL 订单存储实现
///
/// 状态更新使用 `UPDATE ... WHERE status IN (...)` 的原子守卫；
/// rows_affected 为 0 即前置状态不满足，调用方据此短路。
#[derive(Clone)]
pub struct MySqlOrderStore {
    pool: Arc<Pool<MySql>>,
}

impl MySqlOrderStore {
    pub fn new(pool: Arc<Pool<MySql>>) -> Self {
        Self { pool }
    }

    async fn fetch(&self, order_id: &str) -> DomainResult<Option<PaymentOrder>> {
        let query = r#"
            SELECT id, user_id, order_type, amount_cents, currency, status,
                   provider, external_order_id, description, paid_at,
                   refund_amount_cents, refunded_at, created_at, updated_at
            FROM payment_orders
            WHERE id = ?
        "#;

        let row = sqlx::query_as::<_, PaymentOrderRow>(query)
            .bind(order_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row.map(|r| r.into_order()))
    }
}

#[async_trait]
impl OrderStorePort for MySqlOrderStore {
    /// 保存支付订单
    async fn create(&self, order: &PaymentOrder) -> DomainResult<()> {
        let query = r#"
            INSERT INTO payment_orders (
                id, user_id, order_type, amount_cents, currency, status,
                provider, external_order_id, description, paid_at,
                refund_amount_cents, refunded_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;

        sqlx::query(query)
            .bind(&order.id)
            .bind(&order.user_id)
            .bind(order.order_type.to_string())
            .bind(order.amount.to_cents())
            .bind(order.currency.to_string())
            .bind(order.status.to_string())
            .bind(order.provider.to_string())
            .bind(&order.external_order_id)
            .bind(&order.description)
            .bind(order.paid_at)
            .bind(order.refund_amount.to_cents())
            .bind(order.refunded_at)
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(self.pool.as_ref())
            .await?;

        debug!(order_id = %order.id, "payment order saved");
        Ok(())
    }

    async fn find_by_id(&self, order_id: &str) -> DomainResult<Option<PaymentOrder>> {
        self.fetch(order_id).await
    }

    async fn update_status(
        &self,
        order_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
        meta: StatusMetadata,
    ) -> DomainResult<Option<PaymentOrder>> {
        if from.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let query = format!(
            r#"
            UPDATE payment_orders
            SET status = ?,
                external_order_id = COALESCE(?, external_order_id),
                paid_at = COALESCE(?, paid_at),
                updated_at = ?
            WHERE id = ? AND status IN ({})
            "#,
            placeholders
        );

        let mut q = sqlx::query(&query)
            .bind(to.to_string())
            .bind(&meta.external_order_id)
            .bind(meta.paid_at)
            .bind(Utc::now())
            .bind(order_id);
        for status in from {
            q = q.bind(status.to_string());
        }

        let rows_affected = q.execute(self.pool.as_ref()).await?.rows_affected();
        if rows_affected == 0 {
            debug!(order_id, to = %to, "guarded status update did not apply");
            return Ok(None);
        }
        self.fetch(order_id).await
    }

    async fn apply_refund(
        &self,
        order_id: &str,
        refund: Money,
        refunded_at: DateTime<Utc>,
    ) -> DomainResult<Option<PaymentOrder>> {
        // MySQL 的 SET 从左到右求值，status/refunded_at 读到的是
        // 截断后的最新 refund_amount_cents
        let query = r#"
            UPDATE payment_orders
            SET refund_amount_cents = LEAST(refund_amount_cents + ?, amount_cents),
                status = IF(refund_amount_cents >= amount_cents, 'refunded', status),
                refunded_at = IF(refund_amount_cents >= amount_cents, ?, refunded_at),
                updated_at = ?
            WHERE id = ? AND status = 'paid'
        "#;

        let rows_affected = sqlx::query(query)
            .bind(refund.to_cents().max(0))
            .bind(refunded_at)
            .bind(Utc::now())
            .bind(order_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        if rows_affected == 0 {
            debug!(order_id, "refund did not apply");
            return Ok(None);
        }
        self.fetch(order_id).await
    }

    /// 追加资金流水
    async fn record_transaction(&self, tx: &Transaction) -> DomainResult<()> {
        let query = r#"
            INSERT INTO transactions (
                id, order_id, tx_type, status, amount_cents,
                external_transaction_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#;

        sqlx::query(query)
            .bind(&tx.id)
            .bind(&tx.order_id)
            .bind(tx.tx_type.to_string())
            .bind(tx.status.to_string())
            .bind(tx.amount.to_cents())
            .bind(&tx.external_transaction_id)
            .bind(tx.created_at)
            .execute(self.pool.as_ref())
            .await?;

        debug!(order_id = %tx.order_id, tx_type = %tx.tx_type, "transaction recorded");
        Ok(())
    }
}

/// 数据库行结构体
#[derive(Debug, sqlx::FromRow)]
struct PaymentOrderRow {
    id: String,
    user_id: String,
    order_type: String,
    amount_cents: i64,
    currency: String,
    status: String,
    provider: String,
    external_order_id: Option<String>,
    description: String,
    paid_at: Option<DateTime<Utc>>,
    refund_amount_cents: i64,
    refunded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PaymentOrderRow {
    fn into_order(self) -> PaymentOrder {
        let order_type = OrderType::parse(&self.order_type)
            .unwrap_or_else(|| panic!("Invalid order type: {}", self.order_type));
        let currency = Currency::parse(&self.currency)
            .unwrap_or_else(|| panic!("Invalid currency: {}", self.currency));
        let status = OrderStatus::parse(&self.status)
            .unwrap_or_else(|| panic!("Invalid order status: {}", self.status));
        let provider = PayProvider::parse(&self.provider)
            .unwrap_or_else(|| panic!("Invalid provider: {}", self.provider));

        PaymentOrder {
            id: self.id,
            user_id: self.user_id,
            order_type,
            amount: Money::from_cents(self.amount_cents),
            currency,
            status,
            provider,
            external_order_id: self.external_order_id,
            description: self.description,
            paid_at: self.paid_at,
            refund_amount: Money::from_cents(self.refund_amount_cents),
            refunded_at: self.refunded_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
