//! Actor and reference-entity models
//!
//! These are owned by collaborators (registration, catalog, address book,
//! subscription plans). The core only reads them, except for activating a
//! subscription once its payment completes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_types::{AddressId, PaymentId, PlanId, ServiceId, UserId};

/// Actor kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Customer,
    Worker,
    Broker,
    Admin,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Customer => "customer",
            ActorKind::Worker => "worker",
            ActorKind::Broker => "broker",
            ActorKind::Admin => "admin",
        }
    }
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "customer" | "normal" | "user" => Ok(ActorKind::Customer),
            "worker" => Ok(ActorKind::Worker),
            "broker" => Ok(ActorKind::Broker),
            "admin" => Ok(ActorKind::Admin),
            _ => Err(format!("Invalid actor kind: {}", s)),
        }
    }
}

/// Platform actor
#[derive(Debug, Clone, Serialize)]
pub struct Actor {
    pub id: UserId,
    pub phone: String,
    pub email: Option<String>,
    pub kind: ActorKind,
    pub active: bool,
    pub verified: bool,
    /// Cached from the latest ledger entry; never authoritative over the chain.
    pub wallet_balance: Decimal,
    pub has_active_subscription: bool,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.kind == ActorKind::Admin
    }
}

/// Service pricing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingMode {
    Fixed,
    Inquiry,
}

impl FromStr for PricingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(PricingMode::Fixed),
            "inquiry" => Ok(PricingMode::Inquiry),
            _ => Err(format!("Invalid pricing mode: {}", s)),
        }
    }
}

/// Reference service (catalog collaborator)
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub active: bool,
    pub pricing_mode: PricingMode,
    /// Present iff `pricing_mode == Fixed`
    pub price: Option<Decimal>,
    /// Minutes. Present iff `pricing_mode == Fixed`
    pub duration_minutes: Option<i64>,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
}

impl Service {
    /// `(price, duration_minutes)` for a well-formed fixed-price service.
    pub fn fixed_terms(&self) -> Option<(Decimal, i64)> {
        match (self.pricing_mode, self.price, self.duration_minutes) {
            (PricingMode::Fixed, Some(price), Some(duration)) if duration > 0 => {
                Some((price, duration))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionPlan {
    pub id: PlanId,
    pub name: String,
    pub price: Decimal,
    pub duration_days: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSubscription {
    pub id: i64,
    pub plan_id: PlanId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payment_id: PaymentId,
}

impl UserSubscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Address copied onto a booking at creation time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub address_id: AddressId,
    pub label: String,
    pub line: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Contact details copied onto a booking at creation time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub phone: String,
    pub email: Option<String>,
}

impl From<&Actor> for ContactSnapshot {
    fn from(actor: &Actor) -> Self {
        Self {
            phone: actor.phone.clone(),
            email: actor.email.clone(),
        }
    }
}
