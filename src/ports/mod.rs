pub mod coupon_store_port;
pub mod order_store_port;
pub mod payment_provider_port;
pub mod subscription_store_port;

pub use coupon_store_port::CouponStorePort;
pub use order_store_port::{OrderStorePort, StatusMetadata};
pub use payment_provider_port::{
    PaymentProviderPort, ProviderCheckout, ProviderOrderStatus, ProviderRefundReceipt,
    ProviderRefundRequest, RawNotification,
};
pub use subscription_store_port::SubscriptionStorePort;
