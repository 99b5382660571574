//! 微信支付 v3 适配器
//!
//! 出站请求以 RSA-SHA256 对 `METHOD\nURL\nTIMESTAMP\nNONCE\nBODY\n`
//! 签名，携带在 Authorization 头中；回调先以平台证书验签
//! `timestamp\nnonce\nbody\n`，再以 APIv3 密钥 AES-256-GCM 解密
//! resource 密文（通知 nonce 作 IV，associated_data 参与认证）。

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::value_objects::{
    Money, PayProvider, ProviderNotification, ProviderTradeState,
};
use crate::domain::PaymentOrder;
use crate::infrastructure::config::WeChatPayConfig;
use crate::ports::{
    PaymentProviderPort, ProviderCheckout, ProviderOrderStatus, ProviderRefundReceipt,
    ProviderRefundRequest, RawNotification,
};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use reqwest::Client;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 回调通知允许的时间偏差（秒）
const NOTIFY_MAX_CLOCK_SKEW: i64 = 300;

/// 回调通知信封
#[derive(Debug, Clone, Deserialize)]
struct NotifyEnvelope {
    id: String,
    event_type: String,
    resource: NotifyResource,
}

#[derive(Debug, Clone, Deserialize)]
struct NotifyResource {
    algorithm: String,
    ciphertext: String,
    nonce: String,
    #[serde(default)]
    associated_data: String,
}

/// 微信支付适配器实现
pub struct WeChatPayAdapter {
    config: Arc<WeChatPayConfig>,
    client: Client,
    signing_key: SigningKey<Sha256>,
    platform_key: Option<VerifyingKey<Sha256>>,
}

impl WeChatPayAdapter {
    pub fn new(config: Arc<WeChatPayConfig>) -> DomainResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&config.private_key)
            .map_err(|e| DomainError::CryptoError(format!("Failed to load private key: {}", e)))?;
        let signing_key = SigningKey::<Sha256>::new(private_key);

        let platform_key = match &config.platform_public_key {
            Some(pem) => {
                let key = RsaPublicKey::from_public_key_pem(pem).map_err(|e| {
                    DomainError::CryptoError(format!("Failed to load platform public key: {}", e))
                })?;
                Some(VerifyingKey::<Sha256>::new(key))
            }
            None => None,
        };

        Ok(Self {
            config,
            client: Client::new(),
            signing_key,
            platform_key,
        })
    }

    /// 生成随机字符串
    fn generate_nonce() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// 对报文签名，Base64 输出
    fn sign(&self, message: &str) -> String {
        let mut rng = rand::thread_rng();
        let signature = self.signing_key.sign_with_rng(&mut rng, message.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }

    /// 生成 Authorization 头。url 为不含域名的路径（含查询串）
    fn build_authorization(&self, method: &str, url: &str, body: &str) -> String {
        let timestamp = Utc::now().timestamp().to_string();
        let nonce = Self::generate_nonce();
        let message = format!("{}\n{}\n{}\n{}\n{}\n", method, url, timestamp, nonce, body);
        let signature = self.sign(&message);

        format!(
            "WECHATPAY2-SHA256-RSA2048 mchid=\"{}\",nonce_str=\"{}\",timestamp=\"{}\",serial_no=\"{}\",signature=\"{}\"",
            self.config.mchid, nonce, timestamp, self.config.serial_no, signature
        )
    }

    /// 验证平台签名。未配置平台证书时按配置决定拒绝或降级放行
    fn verify_platform_signature(
        &self,
        timestamp: &str,
        nonce: &str,
        body: &str,
        signature_b64: &str,
    ) -> DomainResult<()> {
        let Some(platform_key) = &self.platform_key else {
            if self.config.allow_unverified_notify {
                // 降级信任：仅沙箱可接受，必须在日志里可见
                warn!(
                    "platform certificate not configured, accepting unverified wechat notification (degraded trust)"
                );
                return Ok(());
            }
            return Err(DomainError::VerificationFailed(
                "platform certificate not configured".to_string(),
            ));
        };

        let signature_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|e| {
                DomainError::VerificationFailed(format!("signature not valid base64: {}", e))
            })?;
        let signature = Signature::try_from(signature_bytes.as_slice()).map_err(|e| {
            DomainError::VerificationFailed(format!("malformed signature: {}", e))
        })?;

        let message = format!("{}\n{}\n{}\n", timestamp, nonce, body);
        platform_key
            .verify(message.as_bytes(), &signature)
            .map_err(|_| {
                DomainError::VerificationFailed("platform signature mismatch".to_string())
            })
    }

    /// AES-256-GCM 解密回调 resource。
    /// APIv3 密钥作对称密钥，通知 nonce 作 IV，密文末 16 字节为
    /// 认证标签（aes-gcm 期望密文与标签连续存放，与报文一致），
    /// associated_data 参与完整性校验。
    fn decrypt_resource(&self, resource: &NotifyResource) -> DomainResult<String> {
        if resource.algorithm != "AEAD_AES_256_GCM" {
            return Err(DomainError::CryptoError(format!(
                "unsupported cipher algorithm: {}",
                resource.algorithm
            )));
        }
        if resource.nonce.len() != 12 {
            return Err(DomainError::CryptoError(format!(
                "invalid nonce length: {}",
                resource.nonce.len()
            )));
        }

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&resource.ciphertext)
            .map_err(|e| DomainError::CryptoError(format!("Base64 decode error: {}", e)))?;

        let cipher = Aes256Gcm::new_from_slice(self.config.api_v3_key.as_bytes())
            .map_err(|e| DomainError::CryptoError(format!("AES init error: {}", e)))?;
        let nonce = Nonce::from_slice(resource.nonce.as_bytes());
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext,
                    aad: resource.associated_data.as_bytes(),
                },
            )
            .map_err(|e| DomainError::CryptoError(format!("Decrypt error: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| DomainError::CryptoError(format!("UTF8 decode error: {}", e)))
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> DomainResult<serde_json::Value> {
        let body_str = body.to_string();
        let authorization = self.build_authorization("POST", path, &body_str);
        let url = format!("{}{}", self.config.base_url, path);

        let response = self
            .client
            .post(&url)
            .header("Authorization", authorization)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body_str)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(path, %status, error = %error_text, "wechat pay API error");
            return Err(DomainError::ProviderApi(format!(
                "wechat API returned {}: {}",
                status, error_text
            )));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        Ok(response.json().await?)
    }

    async fn get_json(&self, path: &str) -> DomainResult<serde_json::Value> {
        let authorization = self.build_authorization("GET", path, "");
        let url = format!("{}{}", self.config.base_url, path);

        let response = self
            .client
            .get(&url)
            .header("Authorization", authorization)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(DomainError::ProviderApi(format!(
                "wechat API returned {}: {}",
                status, error_text
            )));
        }
        Ok(response.json().await?)
    }

    fn map_trade_state(state: &str) -> ProviderTradeState {
        match state {
            "SUCCESS" | "REFUND" => ProviderTradeState::Success,
            "NOTPAY" | "USERPAYING" => ProviderTradeState::Pending,
            "CLOSED" | "REVOKED" => ProviderTradeState::Closed,
            _ => ProviderTradeState::Failed,
        }
    }

    /// 解密后的交易数据映射为规范化结果
    fn map_transaction(&self, data: &serde_json::Value) -> DomainResult<ProviderNotification> {
        let order_id = data["out_trade_no"]
            .as_str()
            .ok_or_else(|| {
                DomainError::ValidationError("Missing out_trade_no in notification".to_string())
            })?
            .to_string();
        let trade_state = data["trade_state"].as_str().unwrap_or("UNKNOWN");

        match trade_state {
            "SUCCESS" => {
                let external_order_id = data["transaction_id"]
                    .as_str()
                    .ok_or_else(|| {
                        DomainError::ValidationError(
                            "Missing transaction_id in notification".to_string(),
                        )
                    })?
                    .to_string();
                let amount = data["amount"]["total"].as_i64().ok_or_else(|| {
                    DomainError::ValidationError("Missing amount.total in notification".to_string())
                })?;
                let paid_at = data["success_time"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);

                Ok(ProviderNotification::PaymentSucceeded {
                    provider: PayProvider::Wechat,
                    order_id,
                    external_order_id,
                    amount: Money::from_cents(amount),
                    paid_at,
                    extra: data.clone(),
                })
            }
            "CLOSED" | "REVOKED" | "PAYERROR" => Ok(ProviderNotification::PaymentFailed {
                provider: PayProvider::Wechat,
                order_id,
                reason: trade_state.to_string(),
            }),
            // NOTPAY/USERPAYING/REFUND：中间状态，退款结果走 REFUND.* 通知
            other => Ok(ProviderNotification::Ignored {
                provider: PayProvider::Wechat,
                order_id: Some(order_id),
                state: other.to_string(),
            }),
        }
    }

    /// 解密后的退款数据映射为规范化结果
    fn map_refund(
        &self,
        event_type: &str,
        data: &serde_json::Value,
    ) -> DomainResult<ProviderNotification> {
        let order_id = data["out_trade_no"]
            .as_str()
            .ok_or_else(|| {
                DomainError::ValidationError("Missing out_trade_no in refund notification".to_string())
            })?
            .to_string();

        if event_type == "REFUND.SUCCESS" {
            let refund_id = data["out_refund_no"]
                .as_str()
                .or_else(|| data["refund_id"].as_str())
                .unwrap_or_default()
                .to_string();
            let refund_amount = data["amount"]["refund"].as_i64().ok_or_else(|| {
                DomainError::ValidationError(
                    "Missing amount.refund in refund notification".to_string(),
                )
            })?;
            Ok(ProviderNotification::RefundSucceeded {
                provider: PayProvider::Wechat,
                order_id,
                refund_id,
                refund_amount: Money::from_cents(refund_amount),
            })
        } else {
            // REFUND.ABNORMAL / REFUND.CLOSED
            Ok(ProviderNotification::RefundFailed {
                provider: PayProvider::Wechat,
                order_id,
                reason: event_type.to_string(),
            })
        }
    }
}

#[async_trait]
impl PaymentProviderPort for WeChatPayAdapter {
    fn provider(&self) -> PayProvider {
        PayProvider::Wechat
    }

    /// Native 下单，返回二维码链接
    async fn create_order(&self, order: &PaymentOrder) -> DomainResult<ProviderCheckout> {
        let body = json!({
            "appid": self.config.appid,
            "mchid": self.config.mchid,
            "description": order.description,
            "out_trade_no": order.id,
            "notify_url": self.config.notify_url,
            "amount": {
                "total": order.amount.to_cents(),
                "currency": order.currency.to_string(),
            },
        });
        debug!(order_id = %order.id, "creating wechat native order");

        let resp = self.post_json("/v3/pay/transactions/native", body).await?;
        let code_url = resp["code_url"]
            .as_str()
            .ok_or_else(|| DomainError::ProviderApi("Missing code_url in response".to_string()))?;

        Ok(ProviderCheckout {
            qr_code: Some(code_url.to_string()),
            pay_url: None,
            pay_params: None,
        })
    }

    async fn query_order(&self, order_id: &str) -> DomainResult<ProviderOrderStatus> {
        let path = format!(
            "/v3/pay/transactions/out-trade-no/{}?mchid={}",
            order_id, self.config.mchid
        );
        let resp = self.get_json(&path).await?;

        let trade_state = resp["trade_state"].as_str().unwrap_or("UNKNOWN").to_string();
        let paid_at = resp["success_time"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(ProviderOrderStatus {
            state: Self::map_trade_state(&trade_state),
            raw_state: trade_state,
            external_order_id: resp["transaction_id"].as_str().map(String::from),
            paid_amount: resp["amount"]["total"].as_i64().map(Money::from_cents),
            paid_at,
        })
    }

    async fn close_order(&self, order_id: &str) -> DomainResult<bool> {
        let path = format!("/v3/pay/transactions/out-trade-no/{}/close", order_id);
        let body = json!({ "mchid": self.config.mchid });

        match self.post_json(&path, body).await {
            Ok(_) => Ok(true),
            Err(DomainError::ProviderApi(msg)) => {
                warn!(order_id, error = %msg, "wechat refused to close order");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> DomainResult<ProviderRefundReceipt> {
        let body = json!({
            "out_trade_no": request.order_id,
            "out_refund_no": request.refund_id,
            "reason": request.reason,
            "notify_url": self.config.notify_url,
            "amount": {
                "refund": request.refund.to_cents(),
                "total": request.total.to_cents(),
                "currency": "CNY",
            },
        });

        let resp = self.post_json("/v3/refund/domestic/refunds", body).await?;
        let external_refund_id = resp["refund_id"].as_str().map(String::from);

        Ok(ProviderRefundReceipt {
            refund_id: request.refund_id.clone(),
            external_refund_id,
        })
    }

    async fn verify_and_parse_notification(
        &self,
        raw: &RawNotification,
    ) -> DomainResult<ProviderNotification> {
        let timestamp = raw.header("Wechatpay-Timestamp").ok_or_else(|| {
            DomainError::VerificationFailed("Missing Wechatpay-Timestamp".to_string())
        })?;
        let nonce = raw
            .header("Wechatpay-Nonce")
            .ok_or_else(|| DomainError::VerificationFailed("Missing Wechatpay-Nonce".to_string()))?;
        let signature = raw.header("Wechatpay-Signature").ok_or_else(|| {
            DomainError::VerificationFailed("Missing Wechatpay-Signature".to_string())
        })?;
        let serial = raw.header("Wechatpay-Serial").ok_or_else(|| {
            DomainError::VerificationFailed("Missing Wechatpay-Serial".to_string())
        })?;
        debug!(serial, "verifying wechat notification");

        // 时间戳新鲜度检查，防重放
        let ts: i64 = timestamp.parse().map_err(|_| {
            DomainError::VerificationFailed(format!("invalid timestamp: {}", timestamp))
        })?;
        if (Utc::now().timestamp() - ts).abs() > NOTIFY_MAX_CLOCK_SKEW {
            return Err(DomainError::VerificationFailed(
                "notification timestamp outside allowed window".to_string(),
            ));
        }

        self.verify_platform_signature(timestamp, nonce, &raw.body, signature)?;

        let envelope: NotifyEnvelope = serde_json::from_str(&raw.body).map_err(|e| {
            DomainError::VerificationFailed(format!("malformed notification envelope: {}", e))
        })?;
        debug!(notify_id = %envelope.id, event_type = %envelope.event_type, "wechat notification verified");

        let plaintext = self.decrypt_resource(&envelope.resource)?;
        let data: serde_json::Value = serde_json::from_str(&plaintext)?;

        if envelope.event_type.starts_with("REFUND.") {
            self.map_refund(&envelope.event_type, &data)
        } else {
            self.map_transaction(&data)
        }
    }
}
