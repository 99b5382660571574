use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 支付宝签名算法。RSA2 (SHA256) 为现行标准，RSA (SHA1) 仅兼容存量商户
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlipaySignType {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "RSA2")]
    Rsa2,
}

impl AlipaySignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlipaySignType::Rsa => "RSA",
            AlipaySignType::Rsa2 => "RSA2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RSA" => Some(AlipaySignType::Rsa),
            "RSA2" => Some(AlipaySignType::Rsa2),
            _ => None,
        }
    }
}

/// 支付宝开放平台配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlipayConfig {
    /// 商户 AppID
    pub app_id: String,

    /// 网关地址
    pub gateway_url: String,

    /// 商户应用私钥（PKCS#8 PEM）
    pub private_key: String,

    /// 支付宝公钥（PEM），用于验证响应与回调签名
    pub alipay_public_key: String,

    /// 签名算法
    pub sign_type: AlipaySignType,

    /// 回调通知地址
    pub notify_url: String,

    /// 支付完成后的同步跳转地址
    pub return_url: Option<String>,
}

impl AlipayConfig {
    pub fn from_env() -> Arc<Self> {
        Arc::new(Self {
            app_id: std::env::var("ALIPAY_APP_ID").expect("ALIPAY_APP_ID must be set"),
            gateway_url: std::env::var("ALIPAY_GATEWAY_URL")
                .unwrap_or_else(|_| "https://openapi.alipay.com/gateway.do".to_string()),
            private_key: std::env::var("ALIPAY_PRIVATE_KEY")
                .expect("ALIPAY_PRIVATE_KEY must be set"),
            alipay_public_key: std::env::var("ALIPAY_PUBLIC_KEY")
                .expect("ALIPAY_PUBLIC_KEY must be set"),
            sign_type: std::env::var("ALIPAY_SIGN_TYPE")
                .ok()
                .and_then(|v| AlipaySignType::parse(&v))
                .unwrap_or(AlipaySignType::Rsa2),
            notify_url: std::env::var("ALIPAY_NOTIFY_URL").unwrap_or_else(|_| {
                format!(
                    "{}/api/webhooks/alipay",
                    std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
                )
            }),
            return_url: std::env::var("ALIPAY_RETURN_URL").ok(),
        })
    }
}
