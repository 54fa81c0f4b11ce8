//! Account collaborators
//!
//! Actors, reference services, subscription plans and address snapshots.
//! The core consumes these read-only; the only write is subscription
//! activation after a completed `subscription` payment.

pub mod db;
pub mod models;
pub mod service;

pub use db::{AccountStore, PgAccountStore};
pub use models::{
    Actor, ActorKind, AddressSnapshot, ContactSnapshot, PricingMode, Service, SubscriptionPlan,
    UserSubscription,
};
pub use service::AccountService;
