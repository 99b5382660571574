use crate::application::dto::{
    CreatePaymentRequest, CreateRefundRequest, ErrorResponse, RenewalTaskResponse, TaskFilter,
};
use crate::application::{PaymentService, RenewalScheduler};
use crate::domain::errors::DomainError;
use crate::domain::value_objects::PayProvider;
use crate::ports::{CouponStorePort, OrderStorePort, RawNotification, SubscriptionStorePort};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 应用状态
pub struct AppState<S, C, U>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    pub payments: Arc<PaymentService<S, C>>,
    pub scheduler: Arc<RenewalScheduler<S, C, U>>,
}

impl<S, C, U> Clone for AppState<S, C, U>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    fn clone(&self) -> Self {
        Self {
            payments: self.payments.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

fn error_response(e: DomainError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        DomainError::ValidationError(_)
        | DomainError::InvalidAmount(_)
        | DomainError::CouponInvalid(_) => StatusCode::BAD_REQUEST,
        DomainError::OrderNotFound(_)
        | DomainError::SubscriptionNotFound(_)
        | DomainError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        DomainError::ProviderRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new("PAYMENT_ERROR", e.to_string())))
}

/// 创建支付订单
pub async fn create_payment<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    info!(user_id = %request.user_id, provider = %request.provider, "received payment creation request");

    state
        .payments
        .create_payment(request)
        .await
        .map(|response| (StatusCode::CREATED, Json(response)))
        .map_err(|e| {
            error!(error = %e, "payment creation error");
            error_response(e)
        })
}

/// 查询订单
pub async fn query_payment<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    state
        .payments
        .query_payment(&order_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(order_id = %order_id, error = %e, "payment query error");
            error_response(e)
        })
}

/// 取消订单
pub async fn cancel_payment<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    state
        .payments
        .cancel_payment(&order_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(order_id = %order_id, error = %e, "payment cancel error");
            error_response(e)
        })
}

/// 发起退款
pub async fn create_refund<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    Path(order_id): Path<String>,
    Json(request): Json<CreateRefundRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    state
        .payments
        .create_refund(&order_id, request)
        .await
        .map(|response| (StatusCode::ACCEPTED, Json(response)))
        .map_err(|e| {
            error!(order_id = %order_id, error = %e, "refund creation error");
            error_response(e)
        })
}

fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (canonical_header(name.as_str()), v.to_string()))
        })
        .collect()
}

/// axum 的头名是小写的，按微信文档的写法规范化便于适配器取用
fn canonical_header(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper && ch.is_ascii_alphabetic() {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
        if ch == '-' {
            upper = true;
        }
    }
    out
}

/// 微信支付回调。
/// 验签失败硬拒绝（非 200 触发微信重投）；业务性失败仍按微信
/// 要求的报文格式应答成功，避免重投风暴；瞬时错误返回 500 让
/// 微信稍后重投。
pub async fn wechat_webhook<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    info!("received wechat payment webhook");
    let raw = RawNotification {
        headers: collect_headers(&headers),
        body,
    };

    match state.payments.handle_notification(PayProvider::Wechat, &raw).await {
        Ok(()) => ack_wechat(StatusCode::OK, "SUCCESS", "成功"),
        Err(e) if e.is_verification() => {
            warn!(error = %e, "wechat webhook rejected: verification failed");
            ack_wechat(StatusCode::UNAUTHORIZED, "FAIL", "invalid signature")
        }
        Err(e) if e.is_transient() => {
            error!(error = %e, "wechat webhook transient failure, asking for redelivery");
            ack_wechat(StatusCode::INTERNAL_SERVER_ERROR, "FAIL", "retry later")
        }
        Err(e) => {
            // 业务性失败：事件已发布给告警订阅者，应答成功终止重投
            warn!(error = %e, "wechat webhook business failure, acknowledged");
            ack_wechat(StatusCode::OK, "SUCCESS", "成功")
        }
    }
}

fn ack_wechat(status: StatusCode, code: &str, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({ "code": code, "message": message })),
    )
}

/// 支付宝回调。应答体为纯文本：success 终止重投，其它触发重投
pub async fn alipay_webhook<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    body: String,
) -> impl IntoResponse
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    info!("received alipay payment webhook");
    let raw = RawNotification {
        headers: HashMap::new(),
        body,
    };

    match state.payments.handle_notification(PayProvider::Alipay, &raw).await {
        Ok(()) => (StatusCode::OK, "success"),
        Err(e) if e.is_verification() => {
            warn!(error = %e, "alipay webhook rejected: verification failed");
            (StatusCode::BAD_REQUEST, "failure")
        }
        Err(e) if e.is_transient() => {
            error!(error = %e, "alipay webhook transient failure, asking for redelivery");
            (StatusCode::INTERNAL_SERVER_ERROR, "failure")
        }
        Err(e) => {
            warn!(error = %e, "alipay webhook business failure, acknowledged");
            (StatusCode::OK, "success")
        }
    }
}

/// 手动触发订阅续费
pub async fn trigger_renewal<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    Path(subscription_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    state
        .scheduler
        .trigger_renewal(&subscription_id)
        .await
        .map(|task| (StatusCode::ACCEPTED, Json(RenewalTaskResponse::from(task))))
        .map_err(|e| {
            error!(subscription_id = %subscription_id, error = %e, "manual renewal error");
            error_response(e)
        })
}

/// 查询续费任务
pub async fn list_renewal_tasks<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    Query(filter): Query<TaskFilter>,
) -> impl IntoResponse
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    let tasks: Vec<RenewalTaskResponse> = state
        .scheduler
        .get_tasks(filter.status, filter.subscription_id.as_deref())
        .into_iter()
        .map(RenewalTaskResponse::from)
        .collect();
    Json(tasks)
}

/// 取消续费任务
pub async fn cancel_renewal_task<S, C, U>(
    State(state): State<AppState<S, C, U>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)>
where
    S: OrderStorePort + 'static,
    C: CouponStorePort + 'static,
    U: SubscriptionStorePort + 'static,
{
    state
        .scheduler
        .cancel_task(&task_id)
        .map(|task| Json(RenewalTaskResponse::from(task)))
        .map_err(error_response)
}

/// 健康检查
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
