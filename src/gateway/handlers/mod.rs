//! HTTP handlers, one module per resource.

pub mod auth;
pub mod bookings;
pub mod conversations;
pub mod health;
pub mod notifications;
pub mod payments;

pub use health::health_check;
