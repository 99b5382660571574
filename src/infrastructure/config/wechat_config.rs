use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 微信支付配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeChatPayConfig {
    /// 商户号
    pub mchid: String,

    /// 商户API证书序列号
    pub serial_no: String,

    /// 商户API私钥内容（PKCS#8格式）
    pub private_key: String,

    /// 商户API v3密钥（用于回调通知解密）
    pub api_v3_key: String,

    /// APPID
    pub appid: String,

    /// API基础URL
    pub base_url: String,

    /// 回调通知地址
    pub notify_url: String,

    /// 微信支付平台证书公钥（PEM），用于回调验签
    pub platform_public_key: Option<String>,

    /// 未配置平台证书时是否放行回调（仅限沙箱环境）。
    /// 放行的每条通知都会以降级信任记入日志。
    pub allow_unverified_notify: bool,
}

impl WeChatPayConfig {
    pub fn from_env() -> Arc<Self> {
        Arc::new(Self {
            mchid: std::env::var("WECHAT_MCHID").expect("WECHAT_MCHID must be set"),
            serial_no: std::env::var("WECHAT_SERIAL_NO").expect("WECHAT_SERIAL_NO must be set"),
            private_key: std::env::var("WECHAT_PRIVATE_KEY")
                .expect("WECHAT_PRIVATE_KEY must be set"),
            api_v3_key: std::env::var("WECHAT_API_V3_KEY").expect("WECHAT_API_V3_KEY must be set"),
            appid: std::env::var("WECHAT_APPID").expect("WECHAT_APPID must be set"),
            base_url: std::env::var("WECHAT_BASE_URL")
                .unwrap_or_else(|_| "https://api.mch.weixin.qq.com".to_string()),
            notify_url: std::env::var("WECHAT_NOTIFY_URL").unwrap_or_else(|_| {
                format!(
                    "{}/api/webhooks/wechat",
                    std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
                )
            }),
            platform_public_key: std::env::var("WECHAT_PLATFORM_PUBLIC_KEY").ok(),
            allow_unverified_notify: std::env::var("WECHAT_ALLOW_UNVERIFIED_NOTIFY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }
}
