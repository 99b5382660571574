//! 支付应用服务：出站操作（下单/查询/取消/退款）与回调入口

use crate::application::dto::{
    CreatePaymentRequest, CreateRefundRequest, PaymentResponse, RefundResponse,
};
use crate::application::lifecycle_service::LifecycleService;
use crate::domain::coupon;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::value_objects::{
    Money, OrderStatus, OrderType, PayProvider, ProviderTradeState,
};
use crate::domain::{PaymentOrder, Subscription};
use crate::ports::{
    CouponStorePort, OrderStorePort, PaymentProviderPort, ProviderRefundRequest, RawNotification,
    StatusMetadata,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 支付服务
///
/// 提供方按订单上的 provider 字段在运行期路由，所以这里持有
/// trait object 而非泛型参数；存储仍沿用泛型端口。
pub struct PaymentService<S: OrderStorePort, C: CouponStorePort> {
    wechat: Arc<dyn PaymentProviderPort>,
    alipay: Arc<dyn PaymentProviderPort>,
    store: Arc<S>,
    coupons: Arc<C>,
    lifecycle: Arc<LifecycleService<S>>,
}

impl<S: OrderStorePort, C: CouponStorePort> PaymentService<S, C> {
    pub fn new(
        wechat: Arc<dyn PaymentProviderPort>,
        alipay: Arc<dyn PaymentProviderPort>,
        store: Arc<S>,
        coupons: Arc<C>,
        lifecycle: Arc<LifecycleService<S>>,
    ) -> Self {
        Self {
            wechat,
            alipay,
            store,
            coupons,
            lifecycle,
        }
    }

    fn adapter(&self, provider: PayProvider) -> &dyn PaymentProviderPort {
        match provider {
            PayProvider::Wechat => self.wechat.as_ref(),
            PayProvider::Alipay => self.alipay.as_ref(),
        }
    }

    /// 创建支付订单
    pub async fn create_payment(
        &self,
        request: CreatePaymentRequest,
    ) -> DomainResult<PaymentResponse> {
        let order_id = request
            .order_id
            .unwrap_or_else(|| format!("ORD{}", Uuid::new_v4().simple()));
        info!(order_id = %order_id, provider = %request.provider, "creating payment");

        // 1. 优惠券校验与折扣计算
        let mut discount = 0i64;
        if let Some(code) = &request.coupon_code {
            discount = self
                .resolve_discount(code, &request.user_id, request.order_type, request.amount_cents)
                .await?;
        }
        let charged = Money::from_cents(request.amount_cents - discount);

        // 2. 创建领域对象并入库
        let order = PaymentOrder::new(
            order_id,
            request.user_id,
            request.order_type,
            charged,
            request.currency,
            request.provider,
            request.description,
        )?;
        self.store.create(&order).await?;
        debug!(order_id = %order.id, "order saved");

        // 3. 在提供方下单
        let checkout = self.adapter(order.provider).create_order(&order).await?;

        // 4. 记录核销（尽力而为）
        if let Some(code) = &request.coupon_code {
            if let Err(e) = self
                .coupons
                .record_redemption(code, &order.user_id, &order.id)
                .await
            {
                warn!(order_id = %order.id, coupon = %code, error = %e, "failed to record coupon redemption");
            }
        }

        info!(order_id = %order.id, amount = charged.to_cents(), "payment created");
        Ok(PaymentResponse::from_order(order, discount, Some(checkout)))
    }

    async fn resolve_discount(
        &self,
        code: &str,
        user_id: &str,
        order_type: OrderType,
        amount_cents: i64,
    ) -> DomainResult<i64> {
        let definition = self
            .coupons
            .find_by_code(code)
            .await?
            .ok_or_else(|| DomainError::CouponInvalid(format!("coupon not found: {}", code)))?;
        let usage = self.coupons.usage(code, user_id).await?;

        let validation = coupon::validate(&definition, order_type, amount_cents, &usage, Utc::now());
        if !validation.valid {
            let reason = validation
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "rejected".to_string());
            return Err(DomainError::CouponInvalid(reason));
        }
        Ok(coupon::calculate_discount(&definition, amount_cents))
    }

    /// 查询订单。pending 订单顺带向提供方对账，对账结果走
    /// 生命周期驱动，与回调共用一条转换路径。
    pub async fn query_payment(&self, order_id: &str) -> DomainResult<PaymentResponse> {
        let order = self
            .store
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| DomainError::OrderNotFound(order_id.to_string()))?;

        if order.status == OrderStatus::Pending {
            debug!(order_id = %order_id, "order pending, reconciling with provider");
            match self.adapter(order.provider).query_order(order_id).await {
                Ok(status) => match status.state {
                    ProviderTradeState::Success => {
                        self.lifecycle
                            .handle_payment_success(
                                order.provider,
                                order_id,
                                status.external_order_id.as_deref().unwrap_or_default(),
                                status.paid_at.unwrap_or_else(Utc::now),
                                status.paid_amount.unwrap_or(order.amount),
                                json!({ "source": "query" }),
                            )
                            .await?;
                    }
                    ProviderTradeState::Closed | ProviderTradeState::Failed => {
                        self.lifecycle
                            .handle_payment_failed(order.provider, order_id, &status.raw_state)
                            .await?;
                    }
                    ProviderTradeState::Pending => {
                        debug!(order_id = %order_id, state = %status.raw_state, "still pending at provider");
                    }
                },
                Err(e) => {
                    // 对账失败不影响查询本身
                    warn!(order_id = %order_id, error = %e, "provider reconciliation failed");
                }
            }
        }

        let order = self
            .store
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| DomainError::OrderNotFound(order_id.to_string()))?;
        Ok(PaymentResponse::from_order(order, 0, None))
    }

    /// 取消待支付订单，并尽力关闭提供方订单
    pub async fn cancel_payment(&self, order_id: &str) -> DomainResult<PaymentResponse> {
        let updated = self
            .store
            .update_status(
                order_id,
                &[OrderStatus::Pending],
                OrderStatus::Canceled,
                StatusMetadata::default(),
            )
            .await?;

        let order = match updated {
            Some(order) => {
                info!(order_id = %order_id, "order canceled");
                if let Err(e) = self.adapter(order.provider).close_order(order_id).await {
                    warn!(order_id = %order_id, error = %e, "failed to close provider order");
                }
                order
            }
            // 前置状态不满足：返回当前订单，不报错
            None => self
                .store
                .find_by_id(order_id)
                .await?
                .ok_or_else(|| DomainError::OrderNotFound(order_id.to_string()))?,
        };
        Ok(PaymentResponse::from_order(order, 0, None))
    }

    /// 发起退款。实际退款结果由提供方回调驱动入账
    pub async fn create_refund(
        &self,
        order_id: &str,
        request: CreateRefundRequest,
    ) -> DomainResult<RefundResponse> {
        let order = self
            .store
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| DomainError::OrderNotFound(order_id.to_string()))?;

        if order.status != OrderStatus::Paid {
            return Err(DomainError::ValidationError(format!(
                "order {} is not refundable in status {}",
                order_id, order.status
            )));
        }

        let refundable = order.refundable().to_cents();
        let refund_cents = request.amount_cents.unwrap_or(refundable);
        if refund_cents <= 0 || refund_cents > refundable {
            return Err(DomainError::InvalidAmount(format!(
                "refund amount {} out of range (refundable {})",
                refund_cents, refundable
            )));
        }

        let refund_id = format!("RFD{}", Uuid::new_v4().simple());
        let provider_request = ProviderRefundRequest {
            order_id: order_id.to_string(),
            refund_id: refund_id.clone(),
            total: order.amount,
            refund: Money::from_cents(refund_cents),
            reason: request.reason,
        };
        let receipt = self
            .adapter(order.provider)
            .create_refund(&provider_request)
            .await?;

        info!(
            order_id = %order_id,
            refund_id = %receipt.refund_id,
            refund_cents,
            "refund accepted by provider"
        );
        Ok(RefundResponse {
            order_id: order_id.to_string(),
            refund_id: receipt.refund_id,
            refund_cents,
        })
    }

    /// webhook 入口：验签、解析、驱动生命周期
    pub async fn handle_notification(
        &self,
        provider: PayProvider,
        raw: &RawNotification,
    ) -> DomainResult<()> {
        let notification = self
            .adapter(provider)
            .verify_and_parse_notification(raw)
            .await?;
        self.lifecycle.apply(notification).await
    }

    /// 续费扣款：创建续费订单并在提供方下单，随后立即查询一次
    /// 结果；支付完成则通过生命周期驱动入账。未完成视作本次
    /// 尝试失败，由调度器退避重试。
    pub async fn charge_renewal(&self, subscription: &Subscription) -> DomainResult<PaymentOrder> {
        let order_id = format!("REN{}", Uuid::new_v4().simple());
        let order = PaymentOrder::new(
            order_id.clone(),
            subscription.user_id.clone(),
            OrderType::Subscription,
            subscription.amount,
            subscription.currency,
            subscription.provider,
            format!("Subscription renewal: {}", subscription.plan_id),
        )?;
        self.store.create(&order).await?;

        let adapter = self.adapter(subscription.provider);
        adapter.create_order(&order).await?;
        let status = adapter.query_order(&order_id).await?;

        match status.state {
            ProviderTradeState::Success => {
                self.lifecycle
                    .handle_payment_success(
                        subscription.provider,
                        &order_id,
                        status.external_order_id.as_deref().unwrap_or_default(),
                        status.paid_at.unwrap_or_else(Utc::now),
                        status.paid_amount.unwrap_or(order.amount),
                        json!({ "source": "renewal", "subscription_id": subscription.id }),
                    )
                    .await?;
                self.store
                    .find_by_id(&order_id)
                    .await?
                    .ok_or_else(|| DomainError::OrderNotFound(order_id))
            }
            _ => Err(DomainError::ProviderApi(format!(
                "renewal payment not completed, provider state: {}",
                status.raw_state
            ))),
        }
    }
}
