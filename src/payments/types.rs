//! Payment Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::core_types::{BookingId, PaymentId, PlanId, UserId};
use crate::ledger::{LedgerDraft, LedgerEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Booking,
    Subscription,
    WalletRecharge,
    WalletDebit,
    Segment,
    Quote,
    Refund,
    Manual,
    Withdrawal,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Booking => "booking",
            PaymentKind::Subscription => "subscription",
            PaymentKind::WalletRecharge => "wallet_recharge",
            PaymentKind::WalletDebit => "wallet_debit",
            PaymentKind::Segment => "segment",
            PaymentKind::Quote => "quote",
            PaymentKind::Refund => "refund",
            PaymentKind::Manual => "manual",
            PaymentKind::Withdrawal => "withdrawal",
        }
    }

    /// Kinds a client may open through `create_order`. The rest are
    /// produced by refunds, admin adjustments and withdrawals.
    pub fn is_orderable(&self) -> bool {
        matches!(
            self,
            PaymentKind::Booking
                | PaymentKind::Subscription
                | PaymentKind::WalletRecharge
                | PaymentKind::WalletDebit
                | PaymentKind::Segment
                | PaymentKind::Quote
        )
    }
}

impl fmt::Display for PaymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booking" => Ok(PaymentKind::Booking),
            "subscription" => Ok(PaymentKind::Subscription),
            "wallet_recharge" => Ok(PaymentKind::WalletRecharge),
            "wallet_debit" => Ok(PaymentKind::WalletDebit),
            "segment" => Ok(PaymentKind::Segment),
            "quote" => Ok(PaymentKind::Quote),
            "refund" => Ok(PaymentKind::Refund),
            "manual" => Ok(PaymentKind::Manual),
            "withdrawal" => Ok(PaymentKind::Withdrawal),
            _ => Err(format!("Invalid payment kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Gateway,
    Wallet,
    Cash,
    Admin,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Gateway => "gateway",
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Admin => "admin",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway" | "razorpay" => Ok(PaymentMethod::Gateway),
            "wallet" => Ok(PaymentMethod::Wallet),
            "cash" => Ok(PaymentMethod::Cash),
            "admin" => Ok(PaymentMethod::Admin),
            _ => Err(format!("Invalid payment method: {}", s)),
        }
    }
}

/// Payment status.
///
/// ```text
/// pending ──► completed ──► refunded
///    │
///    ├──► failed
///    └──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    /// Withdrawal claimed by an approval, payout in flight
    Processing,
    Completed,
    Failed,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (
                PaymentStatus::Pending,
                PaymentStatus::Processing
                    | PaymentStatus::Completed
                    | PaymentStatus::Failed
                    | PaymentStatus::Cancelled
            ) | (
                PaymentStatus::Processing,
                PaymentStatus::Completed | PaymentStatus::Pending
            ) | (PaymentStatus::Completed, PaymentStatus::Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            _ => Err(format!("Invalid payment status: {}", s)),
        }
    }
}

/// Entity a payment pays for. Stored as `related_entity_kind/id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentRelation {
    Booking(BookingId),
    SubscriptionPlan(PlanId),
    /// Refund rows point at the payment they compensate
    Payment(PaymentId),
}

impl PaymentRelation {
    pub fn kind_str(&self) -> &'static str {
        match self {
            PaymentRelation::Booking(_) => "booking",
            PaymentRelation::SubscriptionPlan(_) => "subscription_plan",
            PaymentRelation::Payment(_) => "payment",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            PaymentRelation::Booking(id)
            | PaymentRelation::SubscriptionPlan(id)
            | PaymentRelation::Payment(id) => *id,
        }
    }

    pub fn from_parts(kind: Option<&str>, id: Option<i64>) -> Option<Self> {
        match (kind?, id?) {
            ("booking", id) => Some(PaymentRelation::Booking(id)),
            ("subscription_plan", id) => Some(PaymentRelation::SubscriptionPlan(id)),
            ("payment", id) => Some(PaymentRelation::Payment(id)),
            _ => None,
        }
    }

    pub fn booking_id(&self) -> Option<BookingId> {
        match self {
            PaymentRelation::Booking(id) => Some(*id),
            _ => None,
        }
    }
}

/// Payment (ledger head)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub id: PaymentId,
    pub reference: String,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub kind: PaymentKind,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub relation: Option<PaymentRelation>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque external-safe reference, `PAY_<ulid>`.
pub fn new_reference() -> String {
    format!("PAY_{}", ulid::Ulid::new())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub reference: String,
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: PaymentKind,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub relation: Option<PaymentRelation>,
    pub notes: Option<String>,
}

impl NewPayment {
    pub fn new(
        user_id: UserId,
        amount: Decimal,
        kind: PaymentKind,
        method: PaymentMethod,
        status: PaymentStatus,
    ) -> Self {
        Self {
            reference: new_reference(),
            user_id,
            amount,
            kind,
            method,
            status,
            relation: None,
            notes: None,
        }
    }

    pub fn related_to(mut self, relation: Option<PaymentRelation>) -> Self {
        self.relation = relation;
        self
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
}

/// Compare-and-set status change, applied atomically with its ledger
/// entries and an optional companion row (the refund payment).
#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub payment_id: PaymentId,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub gateway_payment_id: Option<String>,
    pub notes: Option<String>,
    pub entries: Vec<LedgerDraft>,
    pub companion: Option<NewPayment>,
}

impl PaymentTransition {
    pub fn new(payment_id: PaymentId, from: PaymentStatus, to: PaymentStatus) -> Self {
        Self {
            payment_id,
            from,
            to,
            gateway_payment_id: None,
            notes: None,
            entries: Vec::new(),
            companion: None,
        }
    }

    pub fn gateway_payment_id(mut self, id: impl Into<String>) -> Self {
        self.gateway_payment_id = Some(id.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn entry(mut self, draft: LedgerDraft) -> Self {
        self.entries.push(draft);
        self
    }

    pub fn companion(mut self, payment: NewPayment) -> Self {
        self.companion = Some(payment);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub payment: Payment,
    pub companion: Option<Payment>,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(AppliedTransition),
    /// Status was not `from`; carries the current row
    Stale(Payment),
}

/// Client request for `create_order`
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrder {
    pub user_id: UserId,
    pub kind: PaymentKind,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub relation: Option<PaymentRelation>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderCreated {
    pub payment: Payment,
    /// Present for gateway payments
    pub gateway_order: Option<crate::payment_gateway::GatewayOrder>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub original: Payment,
    pub refund: Payment,
    pub ledger_entry_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Processed(PaymentId),
    Duplicate,
    Ignored(String),
}
