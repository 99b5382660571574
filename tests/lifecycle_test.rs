//! 生命周期驱动与续费调度的集成测试。
//! 存储与提供方使用内存替身，端口语义（带守卫的原子更新、
//! 一订阅一任务）与生产实现一致。

use async_trait::async_trait;
use billing_rs::application::event_bus::{EventBus, EventFilter};
use billing_rs::application::{LifecycleService, PaymentService, RenewalConfig, RenewalScheduler};
use billing_rs::domain::coupon::{Coupon, CouponUsage};
use billing_rs::domain::entities::{RenewalTaskStatus, Subscription, SubscriptionStatus};
use billing_rs::domain::errors::{DomainError, DomainResult};
use billing_rs::domain::events::{EventType, PaymentEvent};
use billing_rs::domain::value_objects::{
    Currency, Money, OrderStatus, OrderType, PayProvider, ProviderNotification, ProviderTradeState,
};
use billing_rs::domain::{PaymentOrder, Transaction};
use billing_rs::infrastructure::config::{AlipayConfig, AlipaySignType, WeChatPayConfig};
use billing_rs::infrastructure::{AlipayAdapter, WeChatPayAdapter};
use billing_rs::ports::{
    CouponStorePort, OrderStorePort, PaymentProviderPort, ProviderCheckout, ProviderOrderStatus,
    ProviderRefundReceipt, ProviderRefundRequest, RawNotification, StatusMetadata,
    SubscriptionStorePort,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------- 内存替身

#[derive(Default)]
struct MemoryOrderStore {
    orders: Mutex<HashMap<String, PaymentOrder>>,
    transactions: Mutex<Vec<Transaction>>,
}

impl MemoryOrderStore {
    fn seed(&self, order: PaymentOrder) {
        self.orders.lock().unwrap().insert(order.id.clone(), order);
    }

    fn transaction_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    fn status_of(&self, order_id: &str) -> Option<OrderStatus> {
        self.orders.lock().unwrap().get(order_id).map(|o| o.status)
    }
}

#[async_trait]
impl OrderStorePort for MemoryOrderStore {
    async fn create(&self, order: &PaymentOrder) -> DomainResult<()> {
        self.seed(order.clone());
        Ok(())
    }

    async fn find_by_id(&self, order_id: &str) -> DomainResult<Option<PaymentOrder>> {
        Ok(self.orders.lock().unwrap().get(order_id).cloned())
    }

    async fn update_status(
        &self,
        order_id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
        meta: StatusMetadata,
    ) -> DomainResult<Option<PaymentOrder>> {
        let mut orders = self.orders.lock().unwrap();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(None);
        };
        if !from.contains(&order.status) {
            return Ok(None);
        }
        let applied = match to {
            OrderStatus::Paid => order.mark_paid(
                meta.external_order_id.unwrap_or_default(),
                meta.paid_at.unwrap_or_else(Utc::now),
            ),
            OrderStatus::Failed => order.mark_failed(),
            OrderStatus::Canceled => order.mark_canceled(),
            _ => false,
        };
        Ok(applied.then(|| order.clone()))
    }

    async fn apply_refund(
        &self,
        order_id: &str,
        refund: Money,
        refunded_at: DateTime<Utc>,
    ) -> DomainResult<Option<PaymentOrder>> {
        let mut orders = self.orders.lock().unwrap();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(None);
        };
        let applied = order.apply_refund(refund, refunded_at);
        Ok(applied.then(|| order.clone()))
    }

    async fn record_transaction(&self, tx: &Transaction) -> DomainResult<()> {
        self.transactions.lock().unwrap().push(tx.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryCouponStore;

#[async_trait]
impl CouponStorePort for MemoryCouponStore {
    async fn find_by_code(&self, _code: &str) -> DomainResult<Option<Coupon>> {
        Ok(None)
    }

    async fn usage(&self, _code: &str, _user_id: &str) -> DomainResult<CouponUsage> {
        Ok(CouponUsage::default())
    }

    async fn record_redemption(
        &self,
        _code: &str,
        _user_id: &str,
        _order_id: &str,
    ) -> DomainResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MemorySubscriptionStore {
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl MemorySubscriptionStore {
    fn seed(&self, sub: Subscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(sub.id.clone(), sub);
    }

    fn period_end_of(&self, id: &str) -> Option<DateTime<Utc>> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(id)
            .map(|s| s.current_period_end)
    }
}

#[async_trait]
impl SubscriptionStorePort for MemorySubscriptionStore {
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<Subscription>> {
        Ok(self.subscriptions.lock().unwrap().get(id).cloned())
    }

    async fn find_expiring(&self, before: DateTime<Utc>) -> DomainResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.auto_renew
                    && s.current_period_end <= before
            })
            .cloned()
            .collect())
    }

    async fn extend_period(&self, id: &str, new_period_end: DateTime<Utc>) -> DomainResult<()> {
        if let Some(sub) = self.subscriptions.lock().unwrap().get_mut(id) {
            sub.current_period_end = new_period_end;
        }
        Ok(())
    }
}

/// 提供方替身：按配置在下单/查询时成功或失败
struct StubProvider {
    provider: PayProvider,
    fail_create: bool,
}

impl StubProvider {
    fn healthy(provider: PayProvider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            fail_create: false,
        })
    }

    fn failing(provider: PayProvider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            fail_create: true,
        })
    }
}

#[async_trait]
impl PaymentProviderPort for StubProvider {
    fn provider(&self) -> PayProvider {
        self.provider
    }

    async fn create_order(&self, _order: &PaymentOrder) -> DomainResult<ProviderCheckout> {
        if self.fail_create {
            return Err(DomainError::ProviderApi("gateway unreachable".to_string()));
        }
        Ok(ProviderCheckout::default())
    }

    async fn query_order(&self, order_id: &str) -> DomainResult<ProviderOrderStatus> {
        Ok(ProviderOrderStatus {
            state: ProviderTradeState::Success,
            raw_state: "SUCCESS".to_string(),
            external_order_id: Some(format!("ext-{}", order_id)),
            paid_amount: None,
            paid_at: Some(Utc::now()),
        })
    }

    async fn close_order(&self, _order_id: &str) -> DomainResult<bool> {
        Ok(true)
    }

    async fn create_refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> DomainResult<ProviderRefundReceipt> {
        Ok(ProviderRefundReceipt {
            refund_id: request.refund_id.clone(),
            external_refund_id: None,
        })
    }

    async fn verify_and_parse_notification(
        &self,
        _raw: &RawNotification,
    ) -> DomainResult<ProviderNotification> {
        Err(DomainError::InternalError(
            "stub provider has no notifications".to_string(),
        ))
    }
}

// ---------------------------------------------------------------- 公共装配

fn capture_events(bus: &EventBus) -> Arc<Mutex<Vec<PaymentEvent>>> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    bus.register(EventFilter::All, "test-capture", move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(event);
            Ok(())
        }
    });
    captured
}

fn pending_order(id: &str, cents: i64) -> PaymentOrder {
    PaymentOrder::new(
        id.to_string(),
        "user-1".to_string(),
        OrderType::Subscription,
        Money::from_cents(cents),
        Currency::Cny,
        PayProvider::Wechat,
        "专业版订阅".to_string(),
    )
    .unwrap()
}

fn driver(
    store: &Arc<MemoryOrderStore>,
    bus: &Arc<EventBus>,
) -> LifecycleService<MemoryOrderStore> {
    LifecycleService::new(Arc::clone(store), Arc::clone(bus))
}

fn subscription(id: &str) -> Subscription {
    Subscription {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        plan_id: "pro-monthly".to_string(),
        status: SubscriptionStatus::Active,
        amount: Money::from_cents(2900),
        currency: Currency::Cny,
        provider: PayProvider::Wechat,
        period_days: 30,
        current_period_end: Utc::now() + Duration::days(1),
        auto_renew: true,
    }
}

type TestScheduler = RenewalScheduler<MemoryOrderStore, MemoryCouponStore, MemorySubscriptionStore>;

fn build_scheduler(
    wechat: Arc<dyn PaymentProviderPort>,
    subs: &Arc<MemorySubscriptionStore>,
    store: &Arc<MemoryOrderStore>,
    bus: &Arc<EventBus>,
    config: RenewalConfig,
) -> Arc<TestScheduler> {
    let lifecycle = Arc::new(driver(store, bus));
    let payments = Arc::new(PaymentService::new(
        wechat,
        StubProvider::healthy(PayProvider::Alipay),
        Arc::clone(store),
        Arc::new(MemoryCouponStore),
        lifecycle,
    ));
    Arc::new(RenewalScheduler::new(
        payments,
        Arc::clone(subs),
        Arc::clone(bus),
        config,
    ))
}

fn fast_config(max_retries: u32) -> RenewalConfig {
    RenewalConfig {
        check_interval: std::time::Duration::from_secs(3600),
        renewal_advance_days: 3,
        max_retries,
        retry_base_delay: Duration::seconds(0),
    }
}

// ---------------------------------------------------------------- 驱动测试

#[tokio::test]
async fn wechat_success_notification_drives_order_to_paid() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);
    let lifecycle = driver(&store, &bus);

    store.seed(pending_order("ORD123", 2900));

    lifecycle
        .handle_payment_success(
            PayProvider::Wechat,
            "ORD123",
            "4200001234",
            Utc::now(),
            Money::from_cents(2900),
            serde_json::json!({}),
        )
        .await
        .unwrap();

    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Paid));
    assert_eq!(store.transaction_count(), 1);
    let txs = store.transactions.lock().unwrap();
    assert_eq!(txs[0].amount.to_cents(), 2900);
    assert_eq!(txs[0].external_transaction_id.as_deref(), Some("4200001234"));
    drop(txs);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::PaymentSuccess);
    assert_eq!(events[0].order_id, "ORD123");
    assert_eq!(events[0].user_id, "user-1");
}

#[tokio::test]
async fn duplicate_success_notifications_transition_exactly_once() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let lifecycle = driver(&store, &bus);

    store.seed(pending_order("ORD123", 2900));

    for _ in 0..3 {
        lifecycle
            .handle_payment_success(
                PayProvider::Wechat,
                "ORD123",
                "4200001234",
                Utc::now(),
                Money::from_cents(2900),
                serde_json::json!({}),
            )
            .await
            .unwrap();
    }

    // 状态恰好推进一次，重复通知不产生新流水
    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Paid));
    assert_eq!(store.transaction_count(), 1);
}

#[tokio::test]
async fn success_on_terminal_orders_is_a_noop() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let lifecycle = driver(&store, &bus);

    let mut refunded = pending_order("ORD-R", 1000);
    refunded.mark_paid("tx".to_string(), Utc::now());
    refunded.apply_refund(Money::from_cents(1000), Utc::now());
    store.seed(refunded);

    let mut canceled = pending_order("ORD-C", 1000);
    canceled.mark_canceled();
    store.seed(canceled);

    for id in ["ORD-R", "ORD-C"] {
        lifecycle
            .handle_payment_success(
                PayProvider::Wechat,
                id,
                "tx-again",
                Utc::now(),
                Money::from_cents(1000),
                serde_json::json!({}),
            )
            .await
            .unwrap();
    }

    assert_eq!(store.status_of("ORD-R"), Some(OrderStatus::Refunded));
    assert_eq!(store.status_of("ORD-C"), Some(OrderStatus::Canceled));
    assert_eq!(store.transaction_count(), 0);
}

#[tokio::test]
async fn unmatched_notification_still_emits_event_with_empty_user() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);
    let lifecycle = driver(&store, &bus);

    lifecycle
        .handle_payment_success(
            PayProvider::Alipay,
            "ORD-UNKNOWN",
            "tx",
            Utc::now(),
            Money::from_cents(500),
            serde_json::json!({}),
        )
        .await
        .unwrap();

    assert_eq!(store.transaction_count(), 0);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].user_id, "");
    assert_eq!(events[0].order_id, "ORD-UNKNOWN");
}

#[tokio::test]
async fn partial_refund_accumulates_and_full_refund_transitions() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);
    let lifecycle = driver(&store, &bus);

    let mut order = pending_order("ORD123", 2900);
    order.mark_paid("tx".to_string(), Utc::now());
    store.seed(order);

    lifecycle
        .handle_refund_success(PayProvider::Wechat, "ORD123", "RFD1", Money::from_cents(1000))
        .await
        .unwrap();
    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Paid));

    lifecycle
        .handle_refund_success(PayProvider::Wechat, "ORD123", "RFD2", Money::from_cents(1900))
        .await
        .unwrap();
    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Refunded));

    assert_eq!(store.transaction_count(), 2);
    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .all(|e| e.event_type == EventType::RefundSuccess));
}

#[tokio::test]
async fn failed_payment_records_transaction_and_event() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);
    let lifecycle = driver(&store, &bus);

    store.seed(pending_order("ORD123", 2900));

    lifecycle
        .handle_payment_failed(PayProvider::Wechat, "ORD123", "PAYERROR")
        .await
        .unwrap();

    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Failed));
    assert_eq!(store.transaction_count(), 1);
    let events = events.lock().unwrap();
    assert_eq!(events[0].event_type, EventType::PaymentFailed);
    assert_eq!(events[0].data["reason"], "PAYERROR");
}

#[tokio::test]
async fn failing_subscriber_does_not_block_delivery_or_handling() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());

    bus.register(
        EventFilter::Type(EventType::PaymentSuccess),
        "broken",
        |_| async { Err(DomainError::InternalError("subscriber exploded".to_string())) },
    );
    let events = capture_events(&bus);
    let lifecycle = driver(&store, &bus);

    store.seed(pending_order("ORD123", 2900));
    lifecycle
        .handle_payment_success(
            PayProvider::Wechat,
            "ORD123",
            "tx",
            Utc::now(),
            Money::from_cents(2900),
            serde_json::json!({}),
        )
        .await
        .unwrap();

    // 另一个订阅者照常收到事件，订单照常推进
    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Paid));
}

// ------------------------------------------------------- 微信回调端到端

fn wechat_adapter_for_test() -> WeChatPayAdapter {
    use rsa::pkcs8::EncodePrivateKey;
    let mut rng = rand::thread_rng();
    let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let config = Arc::new(WeChatPayConfig {
        mchid: "1900000001".to_string(),
        serial_no: "TESTSERIAL".to_string(),
        private_key: key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string(),
        api_v3_key: "0123456789abcdef0123456789abcdef".to_string(),
        appid: "wxtest".to_string(),
        base_url: "https://api.mch.weixin.qq.com".to_string(),
        notify_url: "http://localhost:3000/api/webhooks/wechat".to_string(),
        platform_public_key: None,
        allow_unverified_notify: true,
    });
    WeChatPayAdapter::new(config).unwrap()
}

fn encrypted_wechat_notification(plaintext: &str) -> RawNotification {
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes256Gcm, Nonce};
    use base64::Engine;

    let cipher = Aes256Gcm::new_from_slice(b"0123456789abcdef0123456789abcdef").unwrap();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(b"aaabbbcccddd"),
            Payload {
                msg: plaintext.as_bytes(),
                aad: b"transaction",
            },
        )
        .unwrap();

    let body = serde_json::json!({
        "id": "notify-1",
        "event_type": "TRANSACTION.SUCCESS",
        "resource_type": "encrypt-resource",
        "resource": {
            "algorithm": "AEAD_AES_256_GCM",
            "ciphertext": base64::engine::general_purpose::STANDARD.encode(ciphertext),
            "nonce": "aaabbbcccddd",
            "associated_data": "transaction",
        },
        "summary": "支付成功",
    })
    .to_string();

    let mut headers = HashMap::new();
    headers.insert(
        "Wechatpay-Timestamp".to_string(),
        Utc::now().timestamp().to_string(),
    );
    headers.insert("Wechatpay-Nonce".to_string(), "noncenonce".to_string());
    headers.insert("Wechatpay-Signature".to_string(), "c2ln".to_string());
    headers.insert("Wechatpay-Serial".to_string(), "PLATSERIAL".to_string());
    RawNotification { headers, body }
}

#[tokio::test]
async fn wechat_webhook_round_trip_through_payment_service() {
    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);
    let lifecycle = Arc::new(driver(&store, &bus));
    let payments = PaymentService::new(
        Arc::new(wechat_adapter_for_test()),
        StubProvider::healthy(PayProvider::Alipay),
        Arc::clone(&store),
        Arc::new(MemoryCouponStore),
        lifecycle,
    );

    store.seed(pending_order("ORD123", 2900));

    let plaintext = serde_json::json!({
        "out_trade_no": "ORD123",
        "transaction_id": "4200001234",
        "trade_state": "SUCCESS",
        "success_time": "2024-01-01T12:00:00+08:00",
        "amount": { "total": 2900, "currency": "CNY" },
    })
    .to_string();

    payments
        .handle_notification(PayProvider::Wechat, &encrypted_wechat_notification(&plaintext))
        .await
        .unwrap();

    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Paid));
    assert_eq!(store.transaction_count(), 1);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::PaymentSuccess);
    assert_eq!(events[0].order_id, "ORD123");
}

#[tokio::test]
async fn alipay_bad_signature_rejected_before_any_order_effect() {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};

    let mut rng = rand::thread_rng();
    let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let public = rsa::RsaPublicKey::from(&key);
    let adapter = AlipayAdapter::new(Arc::new(AlipayConfig {
        app_id: "2021000000000001".to_string(),
        gateway_url: "https://openapi.alipay.com/gateway.do".to_string(),
        private_key: key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string(),
        alipay_public_key: public
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap(),
        sign_type: AlipaySignType::Rsa2,
        notify_url: "http://localhost:3000/api/webhooks/alipay".to_string(),
        return_url: None,
    }))
    .unwrap();

    let store = Arc::new(MemoryOrderStore::default());
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);
    let lifecycle = Arc::new(driver(&store, &bus));
    let payments = PaymentService::new(
        StubProvider::healthy(PayProvider::Wechat),
        Arc::new(adapter),
        Arc::clone(&store),
        Arc::new(MemoryCouponStore),
        lifecycle,
    );

    store.seed(pending_order("ORD123", 2900));

    // 签名字段长度合法但内容是伪造的
    use base64::Engine;
    let forged_sign = base64::engine::general_purpose::STANDARD.encode([0u8; 256]);
    let pairs = vec![
        ("app_id".to_string(), "2021000000000001".to_string()),
        ("out_trade_no".to_string(), "ORD123".to_string()),
        ("trade_no".to_string(), "2024010122001".to_string()),
        ("trade_status".to_string(), "TRADE_SUCCESS".to_string()),
        ("total_amount".to_string(), "29.00".to_string()),
        ("sign_type".to_string(), "RSA2".to_string()),
        ("sign".to_string(), forged_sign),
    ];
    let raw = RawNotification {
        headers: HashMap::new(),
        body: serde_urlencoded::to_string(&pairs).unwrap(),
    };

    let err = payments
        .handle_notification(PayProvider::Alipay, &raw)
        .await
        .unwrap_err();
    assert!(err.is_verification());

    // 状态机未被触碰，事件一条都没有发布
    assert_eq!(store.status_of("ORD123"), Some(OrderStatus::Pending));
    assert_eq!(store.transaction_count(), 0);
    assert!(events.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------- 调度测试

#[tokio::test]
async fn renewal_succeeds_and_extends_subscription() {
    let store = Arc::new(MemoryOrderStore::default());
    let subs = Arc::new(MemorySubscriptionStore::default());
    let bus = Arc::new(EventBus::new());
    let events = capture_events(&bus);

    let sub = subscription("sub-1");
    let old_period_end = sub.current_period_end;
    subs.seed(sub);

    let scheduler = build_scheduler(
        StubProvider::healthy(PayProvider::Wechat),
        &subs,
        &store,
        &bus,
        fast_config(3),
    );
    scheduler.run_once().await.unwrap();

    let tasks = scheduler.get_tasks(None, None);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, RenewalTaskStatus::Success);
    let order_id = tasks[0].order_id.clone().unwrap();
    assert_eq!(store.status_of(&order_id), Some(OrderStatus::Paid));

    // 订阅周期顺延一个计费周期
    let new_period_end = subs.period_end_of("sub-1").unwrap();
    assert_eq!(new_period_end, old_period_end + Duration::days(30));

    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::SubscriptionRenewed));
}

#[tokio::test]
async fn renewal_exhaustion_marks_task_failed_and_stops_rescheduling() {
    let store = Arc::new(MemoryOrderStore::default());
    let subs = Arc::new(MemorySubscriptionStore::default());
    let bus = Arc::new(EventBus::new());
    subs.seed(subscription("sub-1"));

    let scheduler = build_scheduler(
        StubProvider::failing(PayProvider::Wechat),
        &subs,
        &store,
        &bus,
        fast_config(3),
    );

    // 基础退避为 0，每轮都会立即重试
    for _ in 0..5 {
        scheduler.run_once().await.unwrap();
    }

    let tasks = scheduler.get_tasks(None, None);
    assert_eq!(tasks.len(), 1, "failed task must block new task creation");
    assert_eq!(tasks[0].status, RenewalTaskStatus::Failed);
    assert_eq!(tasks[0].attempts, 3);

    // 继续扫描也不再调度
    scheduler.run_once().await.unwrap();
    let tasks = scheduler.get_tasks(None, None);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempts, 3);
}

#[tokio::test]
async fn one_in_flight_task_per_subscription() {
    let store = Arc::new(MemoryOrderStore::default());
    let subs = Arc::new(MemorySubscriptionStore::default());
    let bus = Arc::new(EventBus::new());
    subs.seed(subscription("sub-1"));

    let scheduler = build_scheduler(
        StubProvider::failing(PayProvider::Wechat),
        &subs,
        &store,
        &bus,
        fast_config(10),
    );
    scheduler.run_once().await.unwrap();
    scheduler.run_once().await.unwrap();

    assert_eq!(scheduler.get_tasks(None, None).len(), 1);
}

#[tokio::test]
async fn manual_trigger_and_cancel() {
    let store = Arc::new(MemoryOrderStore::default());
    let subs = Arc::new(MemorySubscriptionStore::default());
    let bus = Arc::new(EventBus::new());

    let mut sub = subscription("sub-1");
    // 尚未临近到期，正常扫描不会建任务
    sub.current_period_end = Utc::now() + Duration::days(30);
    subs.seed(sub);

    let scheduler = build_scheduler(
        StubProvider::healthy(PayProvider::Wechat),
        &subs,
        &store,
        &bus,
        fast_config(3),
    );
    scheduler.run_once().await.unwrap();
    assert!(scheduler.get_tasks(None, None).is_empty());

    // 人工触发绕过到期窗口
    let task = scheduler.trigger_renewal("sub-1").await.unwrap();
    assert_eq!(task.status, RenewalTaskStatus::Success);

    let err = scheduler.trigger_renewal("missing").await.unwrap_err();
    assert!(matches!(err, DomainError::SubscriptionNotFound(_)));

    // 终态任务不可取消
    assert!(scheduler.cancel_task(&task.id).is_err());
}

#[tokio::test]
async fn cancel_interrupts_retrying_task() {
    let store = Arc::new(MemoryOrderStore::default());
    let subs = Arc::new(MemorySubscriptionStore::default());
    let bus = Arc::new(EventBus::new());
    subs.seed(subscription("sub-1"));

    let scheduler = build_scheduler(
        StubProvider::failing(PayProvider::Wechat),
        &subs,
        &store,
        &bus,
        fast_config(5),
    );

    let task = scheduler.trigger_renewal("sub-1").await.unwrap();
    assert_eq!(task.status, RenewalTaskStatus::Retrying);

    let canceled = scheduler.cancel_task(&task.id).unwrap();
    assert_eq!(canceled.status, RenewalTaskStatus::Failed);
    assert_eq!(canceled.last_error.as_deref(), Some("canceled by operator"));

    // 已取消的任务不再被扫描执行
    scheduler.run_once().await.unwrap();
    let tasks = scheduler.get_tasks(Some(RenewalTaskStatus::Failed), None);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempts, 1);
}

#[tokio::test]
async fn scheduler_start_stop_idempotent() {
    let store = Arc::new(MemoryOrderStore::default());
    let subs = Arc::new(MemorySubscriptionStore::default());
    let bus = Arc::new(EventBus::new());

    let scheduler = build_scheduler(
        StubProvider::healthy(PayProvider::Wechat),
        &subs,
        &store,
        &bus,
        fast_config(3),
    );
    assert!(scheduler.start(fast_config(3)));
    assert!(!scheduler.start(fast_config(3)));
    assert!(scheduler.stop());
    assert!(!scheduler.stop());
}
