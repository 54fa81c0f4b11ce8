//! HMAC-SHA256 signatures used by the gateway.
//!
//! Checkout signature: `hex(hmac(secret, order_id + "|" + payment_id))`.
//! Webhook signature: `hex(hmac(webhook_secret, raw_body))`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `message`.
pub fn sign(secret: &[u8], message: &[u8]) -> CoreResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| CoreError::internal(format!("invalid HMAC key: {}", e)))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn checkout_message(order_id: &str, payment_id: &str) -> String {
    format!("{}|{}", order_id, payment_id)
}

/// Constant-time check of a hex signature. Case-insensitive on the hex.
pub fn verify(secret: &[u8], message: &[u8], provided: &str) -> CoreResult<()> {
    let expected = sign(secret, message)?;
    let provided = provided.trim().to_ascii_lowercase();
    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        Ok(())
    } else {
        Err(CoreError::SignatureMismatch)
    }
}
