//! Booking Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::state::{AssignmentState, BookingKind, BookingState};
use crate::account::{AddressSnapshot, ContactSnapshot};
use crate::core_types::{
    AddressId, AssignmentId, BookingId, LedgerEntryId, PaymentId, ServiceId, UserId,
};
use crate::payments::{OrderCreated, PaymentMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteDecision {
    Accepted,
    Rejected,
}

impl QuoteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteDecision::Accepted => "accepted",
            QuoteDecision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for QuoteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QuoteDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(QuoteDecision::Accepted),
            "rejected" => Ok(QuoteDecision::Rejected),
            _ => Err(format!("Invalid quote decision: {}", s)),
        }
    }
}

/// Admin price for an inquiry booking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub amount: Decimal,
    pub notes: Option<String>,
    /// Length of the visit once scheduled
    pub duration_minutes: i64,
    pub provided_by: UserId,
    pub provided_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision: Option<QuoteDecision>,
    pub reject_reason: Option<String>,
}

impl Quote {
    pub fn is_decided(&self) -> bool {
        self.decided_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub actor_id: UserId,
    pub reason: String,
    pub refund_ledger_id: Option<LedgerEntryId>,
    /// Set when the payment was already completed at cancel time, zero
    /// when the policy keeps it all
    pub refund_amount: Option<Decimal>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Booking {
    pub id: BookingId,
    pub reference: String,
    pub customer_id: UserId,
    pub service_id: ServiceId,
    pub kind: BookingKind,
    pub state: BookingState,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub address: AddressSnapshot,
    pub contact: ContactSnapshot,
    pub notes: Option<String>,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub quote: Option<Quote>,
    pub payment_id: Option<PaymentId>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn hold_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == BookingState::Held && self.hold_expires_at.is_some_and(|t| t <= now)
    }

    /// Apply a transition that already passed its state check.
    pub fn apply(&mut self, t: &BookingTransition, now: DateTime<Utc>) {
        self.state = t.to;
        if let Some(schedule) = t.patch.schedule {
            self.scheduled_start = schedule.map(|(s, _)| s);
            self.scheduled_end = schedule.map(|(_, e)| e);
        }
        if let Some(hold) = t.patch.hold_expires_at {
            self.hold_expires_at = hold;
        }
        if let Some(quote) = &t.patch.quote {
            self.quote = Some(quote.clone());
        }
        if let Some(payment_id) = t.patch.payment_id {
            self.payment_id = Some(payment_id);
        }
        if let Some(cancellation) = &t.patch.cancellation {
            self.cancellation = Some(cancellation.clone());
        }
        self.updated_at = now;
    }
}

/// Opaque external-safe reference, `BK_<ulid>`.
pub fn new_booking_reference() -> String {
    format!("BK_{}", ulid::Ulid::new())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub reference: String,
    pub customer_id: UserId,
    pub service_id: ServiceId,
    pub kind: BookingKind,
    pub state: BookingState,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub address: AddressSnapshot,
    pub contact: ContactSnapshot,
    pub notes: Option<String>,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

/// Field updates carried by a transition. `None` leaves a field alone;
/// `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingPatch {
    pub schedule: Option<Option<(DateTime<Utc>, DateTime<Utc>)>>,
    pub hold_expires_at: Option<Option<DateTime<Utc>>>,
    pub quote: Option<Quote>,
    pub payment_id: Option<PaymentId>,
    pub cancellation: Option<Cancellation>,
}

/// Compare-and-set on `state`, with its audit row
#[derive(Debug, Clone, PartialEq)]
pub struct BookingTransition {
    pub booking_id: BookingId,
    pub from: BookingState,
    pub to: BookingState,
    pub actor_id: Option<UserId>,
    pub detail: String,
    pub patch: BookingPatch,
}

impl BookingTransition {
    pub fn new(booking_id: BookingId, from: BookingState, to: BookingState) -> Self {
        Self {
            booking_id,
            from,
            to,
            actor_id: None,
            detail: String::new(),
            patch: BookingPatch::default(),
        }
    }

    pub fn by(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn schedule(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.patch.schedule = Some(Some((start, end)));
        self
    }

    pub fn clear_schedule(mut self) -> Self {
        self.patch.schedule = Some(None);
        self
    }

    pub fn hold_until(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.patch.hold_expires_at = Some(at);
        self
    }

    pub fn quote(mut self, quote: Quote) -> Self {
        self.patch.quote = Some(quote);
        self
    }

    pub fn payment(mut self, payment_id: PaymentId) -> Self {
        self.patch.payment_id = Some(payment_id);
        self
    }

    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.patch.cancellation = Some(cancellation);
        self
    }
}

#[derive(Debug, Clone)]
pub enum BookingOutcome {
    Applied(Booking),
    /// State was not `from`; carries the current row
    Stale(Booking),
}

/// Audit row, one per transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingEvent {
    pub id: i64,
    pub booking_id: BookingId,
    pub actor_id: Option<UserId>,
    pub from_state: Option<BookingState>,
    pub to_state: BookingState,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub notes: String,
    #[serde(default)]
    pub materials_used: Vec<String>,
    #[serde(default)]
    pub photos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerAssignment {
    pub id: AssignmentId,
    pub booking_id: BookingId,
    pub worker_id: UserId,
    pub assigned_by: UserId,
    pub state: AssignmentState,
    pub assigned_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub start_notes: Option<String>,
    pub completion: Option<CompletionReport>,
    pub tracking_session_id: Option<i64>,
}

impl WorkerAssignment {
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Apply a transition that already passed its state check.
    pub fn apply(&mut self, t: &AssignmentTransition, now: DateTime<Utc>) {
        self.state = t.to;
        match t.to {
            AssignmentState::Accepted => self.accepted_at = Some(now),
            AssignmentState::Rejected => self.rejected_at = Some(now),
            AssignmentState::InProgress => self.started_at = Some(now),
            AssignmentState::Completed => self.completed_at = Some(now),
            AssignmentState::Pending => {}
        }
        if let Some(reason) = &t.patch.rejection_reason {
            self.rejection_reason = Some(reason.clone());
        }
        if let Some(notes) = &t.patch.start_notes {
            self.start_notes = Some(notes.clone());
        }
        if let Some(report) = &t.patch.completion {
            self.completion = Some(report.clone());
        }
        if let Some(session) = t.patch.tracking_session_id {
            self.tracking_session_id = Some(session);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentPatch {
    pub rejection_reason: Option<String>,
    pub start_notes: Option<String>,
    pub completion: Option<CompletionReport>,
    pub tracking_session_id: Option<i64>,
}

/// Assignment CAS, optionally moving the booking in the same transaction
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentTransition {
    pub assignment_id: AssignmentId,
    pub from: AssignmentState,
    pub to: AssignmentState,
    pub patch: AssignmentPatch,
    pub booking: Option<BookingTransition>,
}

#[derive(Debug, Clone)]
pub enum AssignmentOutcome {
    Applied {
        assignment: WorkerAssignment,
        booking: Option<Booking>,
    },
    Stale(WorkerAssignment),
}

/// Location-tracking session bound to an in-progress assignment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingSession {
    pub id: i64,
    pub assignment_id: AssignmentId,
    pub booking_id: BookingId,
    pub worker_id: UserId,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CreateBooking {
    pub customer_id: UserId,
    pub service_id: ServiceId,
    /// Required for fixed-price services, ignored for inquiries
    pub slot_start: Option<DateTime<Utc>>,
    pub address_id: AddressId,
    pub method: PaymentMethod,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvideQuote {
    pub admin_id: UserId,
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub notes: Option<String>,
    /// Defaults to `quote_ttl_hours`
    pub ttl_hours: Option<i64>,
    /// Defaults to 60
    pub duration_minutes: Option<i64>,
}

/// Booking plus the payment that has to complete for it to advance
#[derive(Debug, Clone, Serialize)]
pub struct BookingWithPayment {
    pub booking: Booking,
    pub order: OrderCreated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quote_expiry_boundary() {
        let now = Utc::now();
        let q = Quote {
            amount: dec!(2500),
            notes: None,
            duration_minutes: 60,
            provided_by: 1,
            provided_at: now,
            expires_at: now + Duration::hours(48),
            decided_at: None,
            decision: None,
            reject_reason: None,
        };
        assert!(!q.is_expired(now + Duration::hours(47)));
        assert!(q.is_expired(now + Duration::hours(48)));
        assert!(!q.is_decided());
    }

    #[test]
    fn test_transition_builder() {
        let now = Utc::now();
        let t = BookingTransition::new(1, BookingState::Held, BookingState::Confirmed)
            .by(7)
            .payment(9)
            .hold_until(None);
        assert_eq!(t.actor_id, Some(7));
        assert_eq!(t.patch.payment_id, Some(9));
        assert_eq!(t.patch.hold_expires_at, Some(None));
        assert_eq!(t.patch.schedule, None);

        let t = BookingTransition::new(1, BookingState::QuoteAccepted, BookingState::Held)
            .schedule(now, now + Duration::hours(1));
        assert_eq!(t.patch.schedule, Some(Some((now, now + Duration::hours(1)))));
    }

    #[test]
    fn test_reference_prefix() {
        assert!(new_booking_reference().starts_with("BK_"));
    }
}
