//! In-memory gateway for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::signature;
use super::{GatewayOrder, GatewayPayment, GatewayPaymentStatus, PaymentGateway, PayoutRequest};
use crate::error::{CoreError, CoreResult};

pub const MOCK_KEY_SECRET: &[u8] = b"mock_key_secret";
pub const MOCK_WEBHOOK_SECRET: &[u8] = b"mock_webhook_secret";

pub struct MockGateway {
    orders: Mutex<HashMap<String, GatewayOrder>>,
    captured: Mutex<HashMap<String, GatewayPayment>>,
    payouts: Mutex<Vec<PayoutRequest>>,
    order_seq: AtomicUsize,
    create_count: AtomicUsize,
    refund_count: AtomicUsize,
    fail_fetch: Mutex<bool>,
    fail_payout: Mutex<bool>,
    payout_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            captured: Mutex::new(HashMap::new()),
            payouts: Mutex::new(Vec::new()),
            order_seq: AtomicUsize::new(0),
            create_count: AtomicUsize::new(0),
            refund_count: AtomicUsize::new(0),
            fail_fetch: Mutex::new(false),
            fail_payout: Mutex::new(false),
            payout_gate: Mutex::new(None),
        }
    }

    /// Simulate a customer paying `amount_minor` against `order_id`.
    /// Returns the checkout signature the client would send back.
    pub fn capture(&self, order_id: &str, payment_id: &str, amount_minor: i64) -> String {
        self.captured.lock().unwrap().insert(
            payment_id.to_string(),
            GatewayPayment {
                payment_id: payment_id.to_string(),
                order_id: Some(order_id.to_string()),
                status: GatewayPaymentStatus::Captured,
                amount_minor,
            },
        );
        Self::sign_checkout(order_id, payment_id)
    }

    pub fn sign_checkout(order_id: &str, payment_id: &str) -> String {
        signature::sign(
            MOCK_KEY_SECRET,
            signature::checkout_message(order_id, payment_id).as_bytes(),
        )
        .unwrap()
    }

    pub fn sign_webhook(body: &[u8]) -> String {
        signature::sign(MOCK_WEBHOOK_SECRET, body).unwrap()
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        *self.fail_fetch.lock().unwrap() = fail;
    }

    pub fn set_fail_payout(&self, fail: bool) {
        *self.fail_payout.lock().unwrap() = fail;
    }

    /// Parks the next payout. The first handle fires once it is in
    /// flight; notifying the second lets it finish.
    pub fn gate_payouts(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.payout_gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn refund_count(&self) -> usize {
        self.refund_count.load(Ordering::SeqCst)
    }

    pub fn payouts(&self) -> Vec<PayoutRequest> {
        self.payouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_order(
        &self,
        amount_minor: i64,
        receipt: &str,
        _description: Option<&str>,
    ) -> CoreResult<GatewayOrder> {
        let mut orders = self.orders.lock().unwrap();
        if let Some(existing) = orders.get(receipt) {
            return Ok(existing.clone());
        }
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let order = GatewayOrder {
            order_id: format!("order_mock_{}", seq),
            key_id: "rzp_mock".to_string(),
            amount_minor,
            receipt: receipt.to_string(),
            raw: serde_json::json!({ "id": format!("order_mock_{}", seq) }),
        };
        orders.insert(receipt.to_string(), order.clone());
        Ok(order)
    }

    fn verify_payment_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        sig: &str,
    ) -> CoreResult<()> {
        let message = signature::checkout_message(order_id, payment_id);
        signature::verify(MOCK_KEY_SECRET, message.as_bytes(), sig)
    }

    fn verify_webhook_signature(&self, body: &[u8], sig: &str) -> CoreResult<()> {
        signature::verify(MOCK_WEBHOOK_SECRET, body, sig)
    }

    async fn fetch_payment(&self, payment_id: &str) -> CoreResult<GatewayPayment> {
        if *self.fail_fetch.lock().unwrap() {
            return Err(CoreError::GatewayFailure("mock fetch timeout".into()));
        }
        self.captured
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| CoreError::GatewayFailure(format!("unknown payment {}", payment_id)))
    }

    async fn order_payments(&self, order_id: &str) -> CoreResult<Vec<GatewayPayment>> {
        if *self.fail_fetch.lock().unwrap() {
            return Err(CoreError::GatewayFailure("mock fetch timeout".into()));
        }
        let mut found: Vec<GatewayPayment> = self
            .captured
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.order_id.as_deref() == Some(order_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.payment_id.cmp(&b.payment_id));
        Ok(found)
    }

    async fn refund(&self, payment_id: &str, _amount_minor: i64) -> CoreResult<String> {
        let n = self.refund_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("rfnd_{}_{}", payment_id, n))
    }

    async fn payout(&self, request: &PayoutRequest) -> CoreResult<String> {
        if *self.fail_payout.lock().unwrap() {
            return Err(CoreError::GatewayFailure("mock payout failure".into()));
        }
        let gate = self.payout_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        self.payouts.lock().unwrap().push(request.clone());
        Ok(format!("pout_{}", request.reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_create_order_idempotent() {
        let gw = MockGateway::new();
        let a = gw.create_order(50000, "PAY_1", None).await.unwrap();
        let b = gw.create_order(50000, "PAY_1", None).await.unwrap();
        assert_eq!(a.order_id, b.order_id);
        assert_eq!(gw.create_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_capture_and_verify() {
        let gw = MockGateway::new();
        let sig = gw.capture("order_1", "pay_1", 500);
        assert!(gw.verify_payment_signature("order_1", "pay_1", &sig).is_ok());
        assert_eq!(gw.fetch_payment("pay_1").await.unwrap().amount_minor, 500);
        assert_eq!(gw.order_payments("order_1").await.unwrap().len(), 1);
        assert!(gw.order_payments("order_2").await.unwrap().is_empty());
        gw.set_fail_fetch(true);
        assert!(gw.fetch_payment("pay_1").await.unwrap_err().is_retryable());
        assert!(gw.order_payments("order_1").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_refund_ids_are_distinct() {
        let gw = MockGateway::new();
        let a = gw.refund("pay_1", 100).await.unwrap();
        let b = gw.refund("pay_1", 100).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(gw.refund_count(), 2);
    }
}
