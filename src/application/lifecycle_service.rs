//! 回调规范化与订单生命周期驱动
//!
//! 两个提供方适配器产出的规范化结果在这里汇合，经同一套
//! 幂等转换逻辑推进订单状态机。查询对账与续费调度复用同
//! 一入口，整个系统只有这一条状态转换路径。

use crate::application::event_bus::EventBus;
use crate::domain::errors::DomainResult;
use crate::domain::events::{EventType, PaymentEvent};
use crate::domain::value_objects::{Money, OrderStatus, PayProvider, ProviderNotification};
use crate::domain::Transaction;
use crate::ports::{OrderStorePort, StatusMetadata};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 订单生命周期驱动
///
/// 每个入口按固定顺序执行：
/// 1. 带前置守卫的幂等状态更新（重复通知在此短路）
/// 2. 仅当转换真正发生时，追加不可变资金流水（尽力而为）
/// 3. 无条件发布支付事件——即使订单查不到也发布（user_id 为空），
///    监控订阅者因此总能观测到无法匹配订单的提供方通知
pub struct LifecycleService<S: OrderStorePort> {
    store: Arc<S>,
    bus: Arc<EventBus>,
}

impl<S: OrderStorePort> LifecycleService<S> {
    pub fn new(store: Arc<S>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// 规范化结果统一入口，按事件种类分发
    pub async fn apply(&self, notification: ProviderNotification) -> DomainResult<()> {
        match notification {
            ProviderNotification::PaymentSucceeded {
                provider,
                order_id,
                external_order_id,
                amount,
                paid_at,
                extra,
            } => {
                self.handle_payment_success(
                    provider,
                    &order_id,
                    &external_order_id,
                    paid_at,
                    amount,
                    extra,
                )
                .await
            }
            ProviderNotification::PaymentFailed {
                provider,
                order_id,
                reason,
            } => self.handle_payment_failed(provider, &order_id, &reason).await,
            ProviderNotification::RefundSucceeded {
                provider,
                order_id,
                refund_id,
                refund_amount,
            } => {
                self.handle_refund_success(provider, &order_id, &refund_id, refund_amount)
                    .await
            }
            ProviderNotification::RefundFailed {
                provider,
                order_id,
                reason,
            } => self.handle_refund_failed(provider, &order_id, &reason).await,
            ProviderNotification::Ignored {
                provider,
                order_id,
                state,
            } => {
                debug!(
                    provider = %provider,
                    order_id = ?order_id,
                    state = %state,
                    "intermediate provider state, nothing to drive"
                );
                Ok(())
            }
        }
    }

    /// 支付成功：pending → paid，恰好生效一次
    pub async fn handle_payment_success(
        &self,
        provider: PayProvider,
        order_id: &str,
        external_order_id: &str,
        paid_at: DateTime<Utc>,
        amount: Money,
        extra: serde_json::Value,
    ) -> DomainResult<()> {
        let meta = StatusMetadata {
            external_order_id: Some(external_order_id.to_string()),
            paid_at: Some(paid_at),
        };
        let updated = self
            .store
            .update_status(order_id, &[OrderStatus::Pending], OrderStatus::Paid, meta)
            .await?;

        match &updated {
            Some(order) => {
                info!(
                    order_id = %order_id,
                    provider = %provider,
                    external_order_id = %external_order_id,
                    amount = amount.to_cents(),
                    "payment success applied"
                );
                if amount != order.amount {
                    warn!(
                        order_id = %order_id,
                        notified = amount.to_cents(),
                        expected = order.amount.to_cents(),
                        "notification amount differs from order amount"
                    );
                }
                let tx = Transaction::payment_success(
                    order_id,
                    amount,
                    Some(external_order_id.to_string()),
                );
                self.record_transaction(&tx).await;
            }
            None => {
                // 重复投递或订单缺失：无转换、无流水，事件照常发布
                warn!(
                    order_id = %order_id,
                    provider = %provider,
                    "payment success not applied (duplicate notification or unknown order)"
                );
            }
        }

        let user_id = self.resolve_user_id(&updated, order_id).await;
        let event = PaymentEvent::new(
            EventType::PaymentSuccess,
            provider,
            order_id,
            user_id,
            json!({
                "external_order_id": external_order_id,
                "amount_cents": amount.to_cents(),
                "paid_at": paid_at,
                "order_type": updated.as_ref().map(|o| o.order_type.to_string()),
                "provider_data": extra,
            }),
        );
        self.bus.emit(event).await;
        Ok(())
    }

    /// 支付终局失败：pending → failed
    pub async fn handle_payment_failed(
        &self,
        provider: PayProvider,
        order_id: &str,
        reason: &str,
    ) -> DomainResult<()> {
        let updated = self
            .store
            .update_status(
                order_id,
                &[OrderStatus::Pending],
                OrderStatus::Failed,
                StatusMetadata::default(),
            )
            .await?;

        if let Some(order) = &updated {
            info!(order_id = %order_id, provider = %provider, reason = %reason, "payment failed applied");
            let tx = Transaction::payment_failed(order_id, order.amount);
            self.record_transaction(&tx).await;
        } else {
            debug!(order_id = %order_id, reason = %reason, "payment failed not applied");
        }

        let user_id = self.resolve_user_id(&updated, order_id).await;
        let event = PaymentEvent::new(
            EventType::PaymentFailed,
            provider,
            order_id,
            user_id,
            json!({ "reason": reason }),
        );
        self.bus.emit(event).await;
        Ok(())
    }

    /// 退款成功：金额累计进订单，覆盖全额时 paid → refunded，
    /// 部分退款订单保持 paid
    pub async fn handle_refund_success(
        &self,
        provider: PayProvider,
        order_id: &str,
        refund_id: &str,
        refund_amount: Money,
    ) -> DomainResult<()> {
        let updated = self
            .store
            .apply_refund(order_id, refund_amount, Utc::now())
            .await?;

        if let Some(order) = &updated {
            info!(
                order_id = %order_id,
                provider = %provider,
                refund_id = %refund_id,
                refund_cents = refund_amount.to_cents(),
                status = %order.status,
                "refund applied"
            );
            if refund_amount > order.amount {
                warn!(
                    order_id = %order_id,
                    refund_cents = refund_amount.to_cents(),
                    order_cents = order.amount.to_cents(),
                    "refund notification exceeds order amount, accumulated amount clamped"
                );
            }
            let tx =
                Transaction::refund_success(order_id, refund_amount, Some(refund_id.to_string()));
            self.record_transaction(&tx).await;
        } else {
            warn!(
                order_id = %order_id,
                refund_id = %refund_id,
                "refund not applied (order not paid or unknown)"
            );
        }

        let user_id = self.resolve_user_id(&updated, order_id).await;
        let event = PaymentEvent::new(
            EventType::RefundSuccess,
            provider,
            order_id,
            user_id,
            json!({
                "refund_id": refund_id,
                "refund_cents": refund_amount.to_cents(),
                "order_status": updated.as_ref().map(|o| o.status.to_string()),
            }),
        );
        self.bus.emit(event).await;
        Ok(())
    }

    /// 退款失败：状态机没有对应转换，只通知订阅者
    pub async fn handle_refund_failed(
        &self,
        provider: PayProvider,
        order_id: &str,
        reason: &str,
    ) -> DomainResult<()> {
        warn!(order_id = %order_id, provider = %provider, reason = %reason, "refund failed");

        let order = self.store.find_by_id(order_id).await.unwrap_or_else(|e| {
            error!(order_id = %order_id, error = %e, "order lookup failed during refund failure");
            None
        });
        let user_id = order.map(|o| o.user_id).unwrap_or_default();
        let event = PaymentEvent::new(
            EventType::RefundFailed,
            provider,
            order_id,
            user_id,
            json!({ "reason": reason }),
        );
        self.bus.emit(event).await;
        Ok(())
    }

    /// 审计流水尽力而为：写入失败记日志，绝不回滚或打断主流程
    async fn record_transaction(&self, tx: &Transaction) {
        if let Err(e) = self.store.record_transaction(tx).await {
            error!(
                order_id = %tx.order_id,
                tx_type = %tx.tx_type,
                error = %e,
                "failed to record transaction (continuing)"
            );
        }
    }

    /// 事件里的 user_id：转换结果里有就用，否则回查订单，
    /// 订单缺失时为空串
    async fn resolve_user_id(
        &self,
        updated: &Option<crate::domain::PaymentOrder>,
        order_id: &str,
    ) -> String {
        if let Some(order) = updated {
            return order.user_id.clone();
        }
        match self.store.find_by_id(order_id).await {
            Ok(Some(order)) => order.user_id,
            Ok(None) => String::new(),
            Err(e) => {
                error!(order_id = %order_id, error = %e, "order lookup failed while resolving user");
                String::new()
            }
        }
    }
}
