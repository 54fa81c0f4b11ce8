//! Payment Gateway Adapter
//!
//! Wraps the external payment provider: order creation, capture lookup,
//! refunds, payouts and signature checks. Adapters never touch storage.

pub mod razorpay;
pub mod signature;
pub mod webhook;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::Serialize;

use crate::core_types::UserId;
use crate::error::CoreResult;

pub use razorpay::{RazorpayClient, RazorpayConfig};
pub use webhook::{WebhookEvent, WebhookEventKind, parse_event};

/// Order handed back to the client for checkout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayOrder {
    pub order_id: String,
    /// Public key the client SDK needs
    pub key_id: String,
    pub amount_minor: i64,
    pub receipt: String,
    /// Provider response as received
    pub raw: serde_json::Value,
}

/// Provider-side payment status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayPaymentStatus {
    Created,
    Authorized,
    Captured,
    Refunded,
    Failed,
    Unknown(String),
}

impl GatewayPaymentStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "authorized" => Self::Authorized,
            "captured" => Self::Captured,
            "refunded" => Self::Refunded,
            "failed" => Self::Failed,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Money has moved (or is authorized and will auto-capture).
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Captured | Self::Authorized)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPayment {
    pub payment_id: String,
    pub order_id: Option<String>,
    pub status: GatewayPaymentStatus,
    pub amount_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutRequest {
    /// Our payment reference, used as the provider idempotency key
    pub reference: String,
    pub user_id: UserId,
    pub amount_minor: i64,
    pub narration: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    /// Create a checkout order. Idempotent on `receipt`.
    async fn create_order(
        &self,
        amount_minor: i64,
        receipt: &str,
        description: Option<&str>,
    ) -> CoreResult<GatewayOrder>;

    /// Check the checkout signature over `order_id|payment_id`.
    fn verify_payment_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> CoreResult<()>;

    /// Check the webhook signature over the raw body.
    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> CoreResult<()>;

    async fn fetch_payment(&self, payment_id: &str) -> CoreResult<GatewayPayment>;

    /// Every payment attempt made against a checkout order.
    async fn order_payments(&self, order_id: &str) -> CoreResult<Vec<GatewayPayment>>;

    /// Refund to source. Returns the provider refund id.
    async fn refund(&self, payment_id: &str, amount_minor: i64) -> CoreResult<String>;

    /// Bank payout for a worker withdrawal. Returns the provider payout id.
    async fn payout(&self, request: &PayoutRequest) -> CoreResult<String>;
}
