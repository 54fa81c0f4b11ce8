//! Gateway webhook payloads

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    PaymentCaptured,
    PaymentFailed,
    /// Events the core does not act on
    Other(String),
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            WebhookEventKind::PaymentCaptured => "payment.captured",
            WebhookEventKind::PaymentFailed => "payment.failed",
            WebhookEventKind::Other(s) => s,
        }
    }
}

impl From<&str> for WebhookEventKind {
    fn from(s: &str) -> Self {
        match s {
            "payment.captured" => WebhookEventKind::PaymentCaptured,
            "payment.failed" => WebhookEventKind::PaymentFailed,
            other => WebhookEventKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub kind: WebhookEventKind,
    pub payment_id: String,
    pub order_id: Option<String>,
    pub status: String,
    /// Smallest currency unit
    pub amount_minor: i64,
}

#[derive(Deserialize)]
struct RawEvent {
    event: String,
    payload: RawPayload,
}

#[derive(Deserialize)]
struct RawPayload {
    payment: Option<RawPaymentSlot>,
}

/// The payment object arrives either bare or wrapped in `entity`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPaymentSlot {
    Wrapped { entity: RawPayment },
    Bare(RawPayment),
}

#[derive(Deserialize)]
struct RawPayment {
    id: String,
    order_id: Option<String>,
    status: String,
    amount: i64,
}

/// Parse a webhook body. Call only after the signature is verified.
pub fn parse_event(body: &[u8]) -> CoreResult<WebhookEvent> {
    let raw: RawEvent = serde_json::from_slice(body)
        .map_err(|e| CoreError::validation(format!("malformed webhook body: {}", e)))?;
    let payment = match raw.payload.payment {
        Some(RawPaymentSlot::Wrapped { entity }) => entity,
        Some(RawPaymentSlot::Bare(p)) => p,
        None => return Err(CoreError::validation("webhook carries no payment object")),
    };
    Ok(WebhookEvent {
        kind: WebhookEventKind::from(raw.event.as_str()),
        payment_id: payment.id,
        order_id: payment.order_id,
        status: payment.status,
        amount_minor: payment.amount,
    })
}
