//! Core types used throughout the system
//!
//! Identifier aliases shared by every module. All ids are 64-bit integers
//! issued by the relational store; external references (booking/payment
//! references, gateway ids) are opaque strings.

/// Actor ID (customer, worker, broker or admin).
pub type UserId = i64;

/// Booking ID
pub type BookingId = i64;

/// Payment (ledger head) ID
pub type PaymentId = i64;

/// Wallet ledger entry ID
pub type LedgerEntryId = i64;

/// Reference service ID (catalog collaborator)
pub type ServiceId = i64;

/// Worker assignment ID
pub type AssignmentId = i64;

/// Notification ID
pub type NotificationId = i64;

/// Conversation ID
pub type ConversationId = i64;

/// Conversation message ID
pub type MessageId = i64;

/// Subscription plan ID
pub type PlanId = i64;

/// Customer address ID (address book collaborator)
pub type AddressId = i64;

/// Currency code used for every payment
pub const CURRENCY_INR: &str = "INR";
