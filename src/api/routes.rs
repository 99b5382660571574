use super::handlers::*;
use crate::ports::{CouponStorePort, OrderStorePort, SubscriptionStorePort};
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router<S, C, U>(state: AppState<S, C, U>) -> Router
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    Router::new()
        .route("/health", get(health_check))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/:order_id", get(query_payment))
        .route("/api/payments/:order_id/cancel", post(cancel_payment))
        .route("/api/payments/:order_id/refunds", post(create_refund))
        .route("/api/webhooks/wechat", post(wechat_webhook))
        .route("/api/webhooks/alipay", post(alipay_webhook))
        .route("/api/renewals/tasks", get(list_renewal_tasks))
        .route("/api/renewals/tasks/:task_id", delete(cancel_renewal_task))
        .route(
            "/api/renewals/:subscription_id/trigger",
            post(trigger_renewal),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
