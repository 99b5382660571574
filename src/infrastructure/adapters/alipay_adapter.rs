//! 支付宝开放平台适配器
//!
//! 出站请求把除 sign 外的全部参数按 ASCII 键序拼成 `key=value`
//! 串后以商户私钥 RSA 签名（RSA2/SHA256 或 RSA/SHA1 由配置决定），
//! 表单提交到网关；业务层 code 必须为 "10000"。回调通知以支付宝
//! 公钥对除 sign/sign_type 外的全部字段验签，缺签或验签失败一律
//! 硬拒绝。接口金额为十进制元字符串，进出都只在本适配器换算。

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::value_objects::{
    Money, PayProvider, ProviderNotification, ProviderTradeState,
};
use crate::domain::PaymentOrder;
use crate::infrastructure::config::{AlipayConfig, AlipaySignType};
use crate::ports::{
    PaymentProviderPort, ProviderCheckout, ProviderOrderStatus, ProviderRefundReceipt,
    ProviderRefundRequest, RawNotification,
};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::Client;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use sha1::Sha1;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 支付宝适配器实现
pub struct AlipayAdapter {
    config: Arc<AlipayConfig>,
    client: Client,
    private_key: RsaPrivateKey,
    alipay_public_key: RsaPublicKey,
}

impl AlipayAdapter {
    pub fn new(config: Arc<AlipayConfig>) -> DomainResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&config.private_key)
            .map_err(|e| DomainError::CryptoError(format!("Failed to load private key: {}", e)))?;
        let alipay_public_key = RsaPublicKey::from_public_key_pem(&config.alipay_public_key)
            .map_err(|e| {
                DomainError::CryptoError(format!("Failed to load alipay public key: {}", e))
            })?;

        Ok(Self {
            config,
            client: Client::new(),
            private_key,
            alipay_public_key,
        })
    }

    /// 待签名串：按 ASCII 键序拼接 `key=value`，跳过空值与排除键
    fn signing_content(params: &BTreeMap<String, String>, exclude: &[&str]) -> String {
        params
            .iter()
            .filter(|(k, v)| !exclude.contains(&k.as_str()) && !v.is_empty())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn sign(&self, content: &str, sign_type: AlipaySignType) -> String {
        let mut rng = rand::thread_rng();
        let signature = match sign_type {
            AlipaySignType::Rsa2 => {
                let key = SigningKey::<Sha256>::new(self.private_key.clone());
                key.sign_with_rng(&mut rng, content.as_bytes()).to_bytes()
            }
            AlipaySignType::Rsa => {
                let key = SigningKey::<Sha1>::new(self.private_key.clone());
                key.sign_with_rng(&mut rng, content.as_bytes()).to_bytes()
            }
        };
        base64::engine::general_purpose::STANDARD.encode(signature)
    }

    fn verify(
        &self,
        content: &str,
        signature_b64: &str,
        sign_type: AlipaySignType,
    ) -> DomainResult<()> {
        let signature_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|e| {
                DomainError::VerificationFailed(format!("sign not valid base64: {}", e))
            })?;
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| DomainError::VerificationFailed(format!("malformed sign: {}", e)))?;

        let verified = match sign_type {
            AlipaySignType::Rsa2 => {
                VerifyingKey::<Sha256>::new(self.alipay_public_key.clone())
                    .verify(content.as_bytes(), &signature)
                    .is_ok()
            }
            AlipaySignType::Rsa => VerifyingKey::<Sha1>::new(self.alipay_public_key.clone())
                .verify(content.as_bytes(), &signature)
                .is_ok(),
        };
        if verified {
            Ok(())
        } else {
            Err(DomainError::VerificationFailed(
                "alipay signature mismatch".to_string(),
            ))
        }
    }

    /// 构造公共参数并签名
    fn build_request(&self, method: &str, biz_content: &serde_json::Value) -> BTreeMap<String, String> {
        // 支付宝网关要求东八区时间
        let timestamp = (Utc::now() + Duration::hours(8))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.config.app_id.clone());
        params.insert("method".to_string(), method.to_string());
        params.insert("format".to_string(), "JSON".to_string());
        params.insert("charset".to_string(), "utf-8".to_string());
        params.insert(
            "sign_type".to_string(),
            self.config.sign_type.as_str().to_string(),
        );
        params.insert("timestamp".to_string(), timestamp);
        params.insert("version".to_string(), "1.0".to_string());
        params.insert("notify_url".to_string(), self.config.notify_url.clone());
        params.insert("biz_content".to_string(), biz_content.to_string());

        let content = Self::signing_content(&params, &["sign"]);
        let sign = self.sign(&content, self.config.sign_type);
        params.insert("sign".to_string(), sign);
        params
    }

    /// 调用网关并拆出业务响应。code != "10000" 是业务拒绝而非传输错误
    async fn execute(&self, method: &str, biz_content: serde_json::Value) -> DomainResult<serde_json::Value> {
        let params = self.build_request(method, &biz_content);
        debug!(method, "calling alipay gateway");

        let response = self
            .client
            .post(&self.config.gateway_url)
            .form(&params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::ProviderApi(format!(
                "alipay gateway returned {}",
                status
            )));
        }

        let body: serde_json::Value = response.json().await?;
        let response_key = format!("{}_response", method.replace('.', "_"));
        let payload = body
            .get(&response_key)
            .cloned()
            .ok_or_else(|| {
                DomainError::ProviderApi(format!("missing {} in gateway response", response_key))
            })?;

        let code = payload["code"].as_str().unwrap_or_default();
        if code != "10000" {
            let sub_code = payload["sub_code"].as_str().unwrap_or(code);
            let sub_msg = payload["sub_msg"]
                .as_str()
                .or_else(|| payload["msg"].as_str())
                .unwrap_or("unknown error");
            return Err(DomainError::ProviderRejected {
                code: sub_code.to_string(),
                message: sub_msg.to_string(),
            });
        }
        Ok(payload)
    }

    fn map_trade_status(status: &str) -> ProviderTradeState {
        match status {
            "TRADE_SUCCESS" | "TRADE_FINISHED" => ProviderTradeState::Success,
            "WAIT_BUYER_PAY" => ProviderTradeState::Pending,
            "TRADE_CLOSED" => ProviderTradeState::Closed,
            _ => ProviderTradeState::Failed,
        }
    }

    /// 解析 "yyyy-MM-dd HH:mm:ss"（东八区）时间
    fn parse_gmt(s: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive - Duration::hours(8), Utc))
    }
}

#[async_trait]
impl PaymentProviderPort for AlipayAdapter {
    fn provider(&self) -> PayProvider {
        PayProvider::Alipay
    }

    /// 电脑网站支付：签名后的参数即收银台，不经网关往返。
    /// pay_url 供跳转，pay_params 供客户端自行构造表单提交
    async fn create_order(&self, order: &PaymentOrder) -> DomainResult<ProviderCheckout> {
        let biz_content = json!({
            "out_trade_no": order.id,
            "total_amount": order.amount.to_yuan_string(),
            "subject": order.description,
            "product_code": "FAST_INSTANT_TRADE_PAY",
        });
        let mut params = self.build_request("alipay.trade.page.pay", &biz_content);
        if let Some(return_url) = &self.config.return_url {
            // return_url 参与签名，必须在签名前写入后重签
            params.remove("sign");
            params.insert("return_url".to_string(), return_url.clone());
            let content = Self::signing_content(&params, &["sign"]);
            let sign = self.sign(&content, self.config.sign_type);
            params.insert("sign".to_string(), sign);
        }

        let pairs: Vec<(String, String)> = params.clone().into_iter().collect();
        let query = serde_urlencoded::to_string(&pairs)
            .map_err(|e| DomainError::InternalError(format!("encode checkout url: {}", e)))?;

        Ok(ProviderCheckout {
            qr_code: None,
            pay_url: Some(format!("{}?{}", self.config.gateway_url, query)),
            pay_params: Some(serde_json::to_value(params)?),
        })
    }

    async fn query_order(&self, order_id: &str) -> DomainResult<ProviderOrderStatus> {
        let payload = self
            .execute("alipay.trade.query", json!({ "out_trade_no": order_id }))
            .await?;

        let trade_status = payload["trade_status"]
            .as_str()
            .unwrap_or("UNKNOWN")
            .to_string();
        let paid_amount = match payload["total_amount"].as_str() {
            Some(s) => Some(Money::from_yuan_str(s)?),
            None => None,
        };

        Ok(ProviderOrderStatus {
            state: Self::map_trade_status(&trade_status),
            raw_state: trade_status,
            external_order_id: payload["trade_no"].as_str().map(String::from),
            paid_amount,
            paid_at: payload["send_pay_date"].as_str().and_then(Self::parse_gmt),
        })
    }

    async fn close_order(&self, order_id: &str) -> DomainResult<bool> {
        match self
            .execute("alipay.trade.close", json!({ "out_trade_no": order_id }))
            .await
        {
            Ok(_) => Ok(true),
            Err(DomainError::ProviderRejected { code, message }) => {
                warn!(order_id, code = %code, message = %message, "alipay refused to close order");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> DomainResult<ProviderRefundReceipt> {
        let payload = self
            .execute(
                "alipay.trade.refund",
                json!({
                    "out_trade_no": request.order_id,
                    "out_request_no": request.refund_id,
                    "refund_amount": request.refund.to_yuan_string(),
                    "refund_reason": request.reason,
                }),
            )
            .await?;

        Ok(ProviderRefundReceipt {
            refund_id: request.refund_id.clone(),
            external_refund_id: payload["trade_no"].as_str().map(String::from),
        })
    }

    async fn verify_and_parse_notification(
        &self,
        raw: &RawNotification,
    ) -> DomainResult<ProviderNotification> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(&raw.body)
            .map_err(|e| DomainError::VerificationFailed(format!("malformed form body: {}", e)))?;
        let params: BTreeMap<String, String> = pairs.into_iter().collect();

        // 验签先行：缺签或验签失败一律硬拒绝，不碰业务数据
        let sign = params
            .get("sign")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DomainError::VerificationFailed("missing sign".to_string()))?;
        let sign_type = params
            .get("sign_type")
            .and_then(|s| AlipaySignType::parse(s))
            .ok_or_else(|| {
                DomainError::VerificationFailed("missing or unknown sign_type".to_string())
            })?;
        let content = Self::signing_content(&params, &["sign", "sign_type"]);
        self.verify(&content, sign, sign_type)?;

        if params.get("app_id").map(String::as_str) != Some(self.config.app_id.as_str()) {
            return Err(DomainError::VerificationFailed(
                "notification app_id mismatch".to_string(),
            ));
        }

        let order_id = params
            .get("out_trade_no")
            .cloned()
            .ok_or_else(|| DomainError::ValidationError("missing out_trade_no".to_string()))?;
        let trade_status = params
            .get("trade_status")
            .cloned()
            .ok_or_else(|| DomainError::ValidationError("missing trade_status".to_string()))?;
        debug!(order_id = %order_id, trade_status = %trade_status, "alipay notification verified");

        // 带 refund_fee 的通知是退款结果，而非支付状态变化
        if let Some(refund_fee) = params.get("refund_fee") {
            let refund_amount = Money::from_yuan_str(refund_fee)?;
            return Ok(ProviderNotification::RefundSucceeded {
                provider: PayProvider::Alipay,
                order_id,
                refund_id: params.get("out_biz_no").cloned().unwrap_or_default(),
                refund_amount,
            });
        }

        match trade_status.as_str() {
            "TRADE_SUCCESS" | "TRADE_FINISHED" => {
                let external_order_id = params
                    .get("trade_no")
                    .cloned()
                    .ok_or_else(|| DomainError::ValidationError("missing trade_no".to_string()))?;
                let amount = params
                    .get("total_amount")
                    .map(|s| Money::from_yuan_str(s))
                    .transpose()?
                    .ok_or_else(|| {
                        DomainError::ValidationError("missing total_amount".to_string())
                    })?;
                let paid_at = params
                    .get("gmt_payment")
                    .and_then(|s| Self::parse_gmt(s))
                    .unwrap_or_else(Utc::now);

                Ok(ProviderNotification::PaymentSucceeded {
                    provider: PayProvider::Alipay,
                    order_id,
                    external_order_id,
                    amount,
                    paid_at,
                    extra: serde_json::to_value(&params)?,
                })
            }
            "TRADE_CLOSED" => Ok(ProviderNotification::PaymentFailed {
                provider: PayProvider::Alipay,
                order_id,
                reason: trade_status,
            }),
            other => Ok(ProviderNotification::Ignored {
                provider: PayProvider::Alipay,
                order_id: Some(order_id),
                state: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};

    /// 私钥与"支付宝公钥"用同一对密钥，便于本地互验
    fn test_adapter() -> AlipayAdapter {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&key);
        let config = Arc::new(AlipayConfig {
            app_id: "2021000000000001".to_string(),
            gateway_url: "https://openapi.alipay.com/gateway.do".to_string(),
            private_key: key
                .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
                .unwrap()
                .to_string(),
            alipay_public_key: public
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .unwrap(),
            sign_type: AlipaySignType::Rsa2,
            notify_url: "http://localhost:3000/api/webhooks/alipay".to_string(),
            return_url: None,
        });
        AlipayAdapter::new(config).unwrap()
    }

    fn signed_notification(adapter: &AlipayAdapter, extra: &[(&str, &str)]) -> String {
        let mut params = BTreeMap::new();
        params.insert("notify_id".to_string(), "n-0001".to_string());
        params.insert("app_id".to_string(), "2021000000000001".to_string());
        params.insert("out_trade_no".to_string(), "ORD123".to_string());
        params.insert("trade_no".to_string(), "2024010122001".to_string());
        params.insert("trade_status".to_string(), "TRADE_SUCCESS".to_string());
        params.insert("total_amount".to_string(), "29.00".to_string());
        params.insert("gmt_payment".to_string(), "2024-01-01 12:00:00".to_string());
        for (k, v) in extra {
            params.insert(k.to_string(), v.to_string());
        }

        let content = AlipayAdapter::signing_content(&params, &["sign", "sign_type"]);
        let sign = adapter.sign(&content, AlipaySignType::Rsa2);
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert("sign".to_string(), sign);

        let pairs: Vec<(String, String)> = params.into_iter().collect();
        serde_urlencoded::to_string(&pairs).unwrap()
    }

    #[test]
    fn test_signing_content_ascii_order_and_exclusions() {
        let mut params = BTreeMap::new();
        params.insert("b_key".to_string(), "2".to_string());
        params.insert("a_key".to_string(), "1".to_string());
        params.insert("sign".to_string(), "xxx".to_string());
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert("empty".to_string(), String::new());

        let content = AlipayAdapter::signing_content(&params, &["sign", "sign_type"]);
        assert_eq!(content, "a_key=1&b_key=2");
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let adapter = test_adapter();
        let content = "a=1&b=2";
        let sign = adapter.sign(content, AlipaySignType::Rsa2);
        assert!(adapter.verify(content, &sign, AlipaySignType::Rsa2).is_ok());
        assert!(adapter.verify("a=1&b=3", &sign, AlipaySignType::Rsa2).is_err());
    }

    #[test]
    fn test_legacy_rsa_sign_verify() {
        let adapter = test_adapter();
        let content = "a=1&b=2";
        let sign = adapter.sign(content, AlipaySignType::Rsa);
        assert!(adapter.verify(content, &sign, AlipaySignType::Rsa).is_ok());
        // 算法不匹配时验签失败
        assert!(adapter.verify(content, &sign, AlipaySignType::Rsa2).is_err());
    }

    #[tokio::test]
    async fn test_valid_notification_maps_to_payment_succeeded() {
        let adapter = test_adapter();
        let body = signed_notification(&adapter, &[]);
        let raw = RawNotification {
            headers: Default::default(),
            body,
        };

        let result = adapter.verify_and_parse_notification(&raw).await.unwrap();
        match result {
            ProviderNotification::PaymentSucceeded {
                order_id,
                external_order_id,
                amount,
                ..
            } => {
                assert_eq!(order_id, "ORD123");
                assert_eq!(external_order_id, "2024010122001");
                // 元字符串在适配器边界换算为分
                assert_eq!(amount.to_cents(), 2900);
            }
            other => panic!("unexpected canonical result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tampered_notification_rejected_before_parsing() {
        let adapter = test_adapter();
        let body = signed_notification(&adapter, &[]).replace("29.00", "0.01");
        let raw = RawNotification {
            headers: Default::default(),
            body,
        };

        let err = adapter.verify_and_parse_notification(&raw).await.unwrap_err();
        assert!(err.is_verification());
    }

    #[tokio::test]
    async fn test_missing_sign_rejected() {
        let adapter = test_adapter();
        let raw = RawNotification {
            headers: Default::default(),
            body: "out_trade_no=ORD123&trade_status=TRADE_SUCCESS".to_string(),
        };

        let err = adapter.verify_and_parse_notification(&raw).await.unwrap_err();
        assert!(err.is_verification());
    }

    #[tokio::test]
    async fn test_refund_notification_maps_to_refund_succeeded() {
        let adapter = test_adapter();
        let body = signed_notification(
            &adapter,
            &[("refund_fee", "10.00"), ("out_biz_no", "RFD001")],
        );
        let raw = RawNotification {
            headers: Default::default(),
            body,
        };

        let result = adapter.verify_and_parse_notification(&raw).await.unwrap();
        match result {
            ProviderNotification::RefundSucceeded {
                refund_id,
                refund_amount,
                ..
            } => {
                assert_eq!(refund_id, "RFD001");
                assert_eq!(refund_amount.to_cents(), 1000);
            }
            other => panic!("unexpected canonical result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trade_closed_maps_to_payment_failed() {
        let adapter = test_adapter();
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), "2021000000000001".to_string());
        params.insert("out_trade_no".to_string(), "ORD456".to_string());
        params.insert("trade_status".to_string(), "TRADE_CLOSED".to_string());
        let content = AlipayAdapter::signing_content(&params, &["sign", "sign_type"]);
        let sign = adapter.sign(&content, AlipaySignType::Rsa2);
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert("sign".to_string(), sign);
        let pairs: Vec<(String, String)> = params.into_iter().collect();
        let raw = RawNotification {
            headers: Default::default(),
            body: serde_urlencoded::to_string(&pairs).unwrap(),
        };

        let result = adapter.verify_and_parse_notification(&raw).await.unwrap();
        assert!(matches!(
            result,
            ProviderNotification::PaymentFailed { reason, .. } if reason == "TRADE_CLOSED"
        ));
    }

    #[tokio::test]
    async fn test_wrong_app_id_rejected() {
        let adapter = test_adapter();
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), "someone-else".to_string());
        params.insert("out_trade_no".to_string(), "ORD123".to_string());
        params.insert("trade_status".to_string(), "TRADE_SUCCESS".to_string());
        let content = AlipayAdapter::signing_content(&params, &["sign", "sign_type"]);
        let sign = adapter.sign(&content, AlipaySignType::Rsa2);
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert("sign".to_string(), sign);
        let pairs: Vec<(String, String)> = params.into_iter().collect();
        let raw = RawNotification {
            headers: Default::default(),
            body: serde_urlencoded::to_string(&pairs).unwrap(),
        };

        let err = adapter.verify_and_parse_notification(&raw).await.unwrap_err();
        assert!(err.is_verification());
    }

    #[tokio::test]
    async fn test_checkout_builds_signed_pay_url() {
        let adapter = test_adapter();
        let order = PaymentOrder::new(
            "ORD123".to_string(),
            "user-1".to_string(),
            crate::domain::value_objects::OrderType::Skill,
            Money::from_cents(2900),
            crate::domain::value_objects::Currency::Cny,
            PayProvider::Alipay,
            "技能解锁".to_string(),
        )
        .unwrap();

        let checkout = adapter.create_order(&order).await.unwrap();
        let url = checkout.pay_url.unwrap();
        assert!(url.starts_with("https://openapi.alipay.com/gateway.do?"));
        assert!(url.contains("method=alipay.trade.page.pay"));
        assert!(url.contains("sign="));

        let params = checkout.pay_params.unwrap();
        assert_eq!(params["app_id"], "2021000000000001");
        assert!(params["biz_content"].as_str().unwrap().contains("29.00"));
    }
}
