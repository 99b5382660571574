use thiserror::Error;

/// 领域层错误类型
#[derive(Error, Debug)]
pub enum DomainError {
    /// 验证错误
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// 订单未找到
    #[error("Payment order not found: {0}")]
    OrderNotFound(String),

    /// 订阅未找到
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// 续费任务未找到
    #[error("Renewal task not found: {0}")]
    TaskNotFound(String),

    /// 金额无效
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// 回调验签失败
    #[error("Signature verification failed: {0}")]
    VerificationFailed(String),

    /// 提供方业务拒绝（如支付宝 code != 10000）
    #[error("Provider rejected request [{code}]: {message}")]
    ProviderRejected { code: String, message: String },

    /// 提供方API错误
    #[error("Provider API error: {0}")]
    ProviderApi(String),

    /// 优惠券不可用
    #[error("Coupon invalid: {0}")]
    CouponInvalid(String),

    /// 数据库错误
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// HTTP请求错误
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// 加密错误
    #[error("Cryptography error: {0}")]
    CryptoError(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl DomainError {
    /// 验签类错误：webhook 边界硬拒绝，由提供方负责重投
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            DomainError::VerificationFailed(_) | DomainError::CryptoError(_)
        )
    }

    /// 瞬时错误：网络/数据库抖动，适合退避重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::HttpError(_) | DomainError::DatabaseError(_) | DomainError::ProviderApi(_)
        )
    }
}

/// 领域结果类型
pub type DomainResult<T> = Result<T, DomainError>;
