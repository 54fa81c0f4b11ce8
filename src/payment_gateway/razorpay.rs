//! Razorpay REST client

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::signature;
use super::{GatewayOrder, GatewayPayment, GatewayPaymentStatus, PaymentGateway, PayoutRequest};
use crate::core_types::CURRENCY_INR;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RazorpayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    /// Source account for payouts
    #[serde(default)]
    pub payout_account_number: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://api.razorpay.com".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

pub struct RazorpayClient {
    config: RazorpayConfig,
    http: reqwest::Client,
    /// receipt -> order, so a retried create returns the same order
    orders: DashMap<String, GatewayOrder>,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
}

#[derive(Deserialize)]
struct PaymentResponse {
    id: String,
    order_id: Option<String>,
    status: String,
    amount: i64,
}

#[derive(Deserialize)]
struct PaymentList {
    items: Vec<PaymentResponse>,
}

impl From<PaymentResponse> for GatewayPayment {
    fn from(p: PaymentResponse) -> Self {
        GatewayPayment {
            payment_id: p.id,
            order_id: p.order_id,
            status: GatewayPaymentStatus::parse(&p.status),
            amount_minor: p.amount,
        }
    }
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

impl RazorpayClient {
    pub fn new(config: RazorpayConfig) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build HTTP client: {}", e)))?;
        tracing::info!(base_url = %config.base_url, "Razorpay client initialized");
        Ok(Self {
            config,
            http,
            orders: DashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send<R>(&self, request: reqwest::RequestBuilder, op: &'static str) -> CoreResult<R>
    where
        R: for<'de> Deserialize<'de>,
    {
        let response = request
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(op, error = %e, "Gateway request failed");
                CoreError::GatewayFailure(format!("{}: {}", op, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(op, %status, body = %body, "Gateway returned error status");
            return Err(CoreError::GatewayFailure(format!("{}: HTTP {}", op, status)));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| CoreError::GatewayFailure(format!("{}: bad response: {}", op, e)))
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    async fn create_order(
        &self,
        amount_minor: i64,
        receipt: &str,
        description: Option<&str>,
    ) -> CoreResult<GatewayOrder> {
        if let Some(existing) = self.orders.get(receipt) {
            return Ok(existing.clone());
        }

        let body = json!({
            "amount": amount_minor,
            "currency": CURRENCY_INR,
            "receipt": receipt,
            "notes": { "description": description.unwrap_or_default() },
        });
        let raw: serde_json::Value = self
            .send(self.http.post(self.url("/v1/orders")).json(&body), "create_order")
            .await?;
        let parsed: OrderResponse = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::GatewayFailure(format!("create_order: {}", e)))?;

        let order = GatewayOrder {
            order_id: parsed.id,
            key_id: self.config.key_id.clone(),
            amount_minor,
            receipt: receipt.to_string(),
            raw,
        };
        tracing::info!(order_id = %order.order_id, receipt, amount_minor, "Gateway order created");
        Ok(self
            .orders
            .entry(receipt.to_string())
            .or_insert(order)
            .clone())
    }

    fn verify_payment_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        sig: &str,
    ) -> CoreResult<()> {
        let message = signature::checkout_message(order_id, payment_id);
        signature::verify(self.config.key_secret.as_bytes(), message.as_bytes(), sig)
    }

    fn verify_webhook_signature(&self, body: &[u8], sig: &str) -> CoreResult<()> {
        signature::verify(self.config.webhook_secret.as_bytes(), body, sig)
    }

    async fn fetch_payment(&self, payment_id: &str) -> CoreResult<GatewayPayment> {
        let path = format!("/v1/payments/{}", payment_id);
        let p: PaymentResponse = self
            .send(self.http.get(self.url(&path)), "fetch_payment")
            .await?;
        Ok(p.into())
    }

    async fn order_payments(&self, order_id: &str) -> CoreResult<Vec<GatewayPayment>> {
        let path = format!("/v1/orders/{}/payments", order_id);
        let list: PaymentList = self
            .send(self.http.get(self.url(&path)), "order_payments")
            .await?;
        Ok(list.items.into_iter().map(GatewayPayment::from).collect())
    }

    async fn refund(&self, payment_id: &str, amount_minor: i64) -> CoreResult<String> {
        let path = format!("/v1/payments/{}/refund", payment_id);
        let r: IdResponse = self
            .send(
                self.http
                    .post(self.url(&path))
                    .json(&json!({ "amount": amount_minor })),
                "refund",
            )
            .await?;
        tracing::info!(payment_id, refund_id = %r.id, amount_minor, "Gateway refund issued");
        Ok(r.id)
    }

    async fn payout(&self, request: &PayoutRequest) -> CoreResult<String> {
        let body = json!({
            "account_number": self.config.payout_account_number,
            "amount": request.amount_minor,
            "currency": CURRENCY_INR,
            "mode": "IMPS",
            "purpose": "payout",
            "reference_id": request.reference,
            "narration": request.narration,
            "notes": { "user_id": request.user_id },
        });
        let r: IdResponse = self
            .send(
                self.http
                    .post(self.url("/v1/payouts"))
                    .header("X-Payout-Idempotency", &request.reference)
                    .json(&body),
                "payout",
            )
            .await?;
        tracing::info!(reference = %request.reference, payout_id = %r.id, "Gateway payout issued");
        Ok(r.id)
    }
}
