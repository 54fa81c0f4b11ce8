//! TreesIndia - Home-services marketplace core
//!
//! Booking lifecycle, payments and the wallet ledger, real-time presence
//! and notifications, conversations and the background scheduler.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier aliases (UserId, BookingId, etc.)
//! - [`env`] - Injected clock and runtime settings
//! - [`error`] - Kind-tagged core error
//! - [`money`] - Decimal amount rules
//! - [`settings`] - Runtime booking settings with cached reload
//! - [`account`] - Actors and reference entities
//! - [`availability`] - Slot generation over a business day
//! - [`ledger`] - Balance-linked wallet ledger (each entry carries the balance before and after)
//! - [`payment_gateway`] - Razorpay adapter, signatures, webhooks
//! - [`payments`] - Payment records, refunds, withdrawals
//! - [`booking`] - Booking and worker-assignment state machines
//! - [`notifications`] - Persisted notifications and push delivery
//! - [`presence`] - WebSocket hub and channel protocol
//! - [`conversations`] - Participant-scoped message threads
//! - [`scheduler`] - Periodic sweeps under a job lock
//! - [`auth`] - JWT issue/verify and bearer middleware
//! - [`gateway`] - HTTP projection

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod logging;
pub mod money;
pub mod settings;

// Domain
pub mod account;
pub mod availability;
pub mod booking;
pub mod conversations;
pub mod ledger;
pub mod notifications;
pub mod payment_gateway;
pub mod payments;
pub mod presence;
pub mod scheduler;

// Edges
pub mod auth;
pub mod gateway;

#[cfg(test)]
pub mod memory_store;
#[cfg(test)]
pub mod test_support;

// Convenient re-exports at crate root
pub use core_types::{BookingId, PaymentId, UserId};
pub use env::{Clock, Environment, SystemClock};
pub use error::{CoreError, CoreResult, ErrorKind};
