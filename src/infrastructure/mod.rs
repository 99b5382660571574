pub mod adapters;
pub mod config;

pub use adapters::{
    AlipayAdapter, MySqlCouponStore, MySqlOrderStore, MySqlSubscriptionStore, WeChatPayAdapter,
};
pub use config::{AlipayConfig, WeChatPayConfig};
