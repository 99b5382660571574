pub mod alipay_config;
pub mod wechat_config;

pub use alipay_config::{AlipayConfig, AlipaySignType};
pub use wechat_config::WeChatPayConfig;
