//! Payments
//!
//! Payment records, gateway checkout, refunds, admin adjustments and
//! worker withdrawals. Wallet effects go through the ledger in the same
//! transaction as the status change that causes them.

pub mod db;
pub mod service;
pub mod types;

pub use db::{PaymentStore, PgPaymentStore};
pub use service::{PaymentListener, PaymentService, SubscriptionActivator};
pub use types::{
    AppliedTransition, CreateOrder, NewPayment, OrderCreated, Payment, PaymentKind, PaymentMethod,
    PaymentRelation, PaymentStatus, PaymentTransition, RefundResult, TransitionOutcome,
    WebhookOutcome, new_reference,
};
