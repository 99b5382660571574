pub mod alipay_adapter;
pub mod mysql_coupon_store;
pub mod mysql_order_store;
pub mod mysql_subscription_store;
pub mod wechat_pay_adapter;

pub use alipay_adapter::AlipayAdapter;
pub use mysql_coupon_store::MySqlCouponStore;
pub use mysql_order_store::MySqlOrderStore;
pub use mysql_subscription_store::MySqlSubscriptionStore;
pub use wechat_pay_adapter::WeChatPayAdapter;
