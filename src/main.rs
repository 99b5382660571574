use billing_rs::api::{self, AppState};
use billing_rs::application::event_bus::EventFilter;
use billing_rs::application::{
    EventBus, LifecycleService, PaymentService, RenewalConfig, RenewalScheduler,
};
use billing_rs::domain::events::EventType;
use billing_rs::infrastructure::{
    AlipayAdapter, AlipayConfig, MySqlCouponStore, MySqlOrderStore, MySqlSubscriptionStore,
    WeChatPayAdapter, WeChatPayConfig,
};
use sqlx::MySqlPool;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // 加载环境变量
    dotenvy::dotenv().ok();

    info!("Starting Billing Service...");

    // 创建数据库连接池
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    info!("Connecting to database...");
    let pool = Arc::new(MySqlPool::connect(&database_url).await?);
    info!("Database connected successfully");

    // 提供方适配器
    let wechat_config = WeChatPayConfig::from_env();
    info!(mchid = %wechat_config.mchid, "WeChat Pay configuration loaded");
    let wechat = Arc::new(WeChatPayAdapter::new(wechat_config)?);

    let alipay_config = AlipayConfig::from_env();
    info!(app_id = %alipay_config.app_id, "Alipay configuration loaded");
    let alipay = Arc::new(AlipayAdapter::new(alipay_config)?);

    // 存储
    let order_store = Arc::new(MySqlOrderStore::new(pool.clone()));
    let coupon_store = Arc::new(MySqlCouponStore::new(pool.clone()));
    let subscription_store = Arc::new(MySqlSubscriptionStore::new(pool.clone()));

    // 事件总线与默认订阅者
    let bus = Arc::new(EventBus::new());
    register_default_subscribers(&bus);

    // 生命周期驱动与支付服务
    let lifecycle = Arc::new(LifecycleService::new(order_store.clone(), bus.clone()));
    let payments = Arc::new(PaymentService::new(
        wechat,
        alipay,
        order_store,
        coupon_store,
        lifecycle,
    ));

    // 续费调度
    let renewal_config = RenewalConfig::from_env();
    let scheduler = Arc::new(RenewalScheduler::new(
        payments.clone(),
        subscription_store,
        bus.clone(),
        renewal_config.clone(),
    ));
    scheduler.start(renewal_config);

    // 路由与服务器
    let app = api::create_router(AppState {
        payments,
        scheduler,
    });

    let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("{}:{}", host, port);

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// 组合根挂载的默认订阅者：权益解锁与告警。
/// 其它子系统（记账、风控）通过同一注册口自行挂载。
fn register_default_subscribers(bus: &Arc<EventBus>) {
    bus.register(
        EventFilter::Type(EventType::PaymentSuccess),
        "entitlement-unlock",
        |event| async move {
            let order_type = event.data["order_type"].as_str().unwrap_or_default();
            info!(
                order_id = %event.order_id,
                user_id = %event.user_id,
                order_type,
                "unlocking entitlement for paid order"
            );
            Ok(())
        },
    );

    bus.register(
        EventFilter::Type(EventType::SubscriptionRenewed),
        "renewal-bookkeeping",
        |event| async move {
            info!(
                order_id = %event.order_id,
                user_id = %event.user_id,
                subscription_id = %event.data["subscription_id"],
                "subscription renewed"
            );
            Ok(())
        },
    );

    // 通配符订阅者：所有事件都过一遍，失败类事件升级为告警日志。
    // user_id 为空说明通知没匹配到订单，必须有人看见
    bus.register(EventFilter::All, "billing-alerts", |event| async move {
        match event.event_type {
            EventType::PaymentFailed | EventType::RefundFailed => {
                warn!(
                    event_type = %event.event_type,
                    order_id = %event.order_id,
                    provider = %event.provider,
                    "payment pipeline failure event"
                );
            }
            _ if event.user_id.is_empty() => {
                warn!(
                    event_type = %event.event_type,
                    order_id = %event.order_id,
                    provider = %event.provider,
                    "event could not be matched to an order"
                );
            }
            _ => {}
        }
        Ok(())
    });
}
