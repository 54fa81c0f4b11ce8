//! Cancellation policy
//!
//! Who may cancel a booking in which state, and how much of the paid
//! amount goes back to the customer's wallet.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use super::state::BookingState;
use super::types::Booking;
use crate::money;
use crate::settings::BookingSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRole {
    Customer,
    Admin,
}

/// Customers may walk away until work starts; admins until the booking
/// is terminal.
pub fn may_cancel(role: CancelRole, state: BookingState) -> bool {
    if state.is_terminal() {
        return false;
    }
    match role {
        CancelRole::Admin => true,
        CancelRole::Customer => state != BookingState::InProgress,
    }
}

/// Refund owed on cancelling `booking`, given `paid` was captured for it.
pub fn refund_due(
    role: CancelRole,
    booking: &Booking,
    paid: Decimal,
    settings: &BookingSettings,
    now: DateTime<Utc>,
) -> Decimal {
    match booking.state {
        BookingState::InProgress => money::apply_fraction(paid, settings.refund_late_fraction),
        BookingState::Confirmed | BookingState::Assigned => match role {
            CancelRole::Admin => paid,
            CancelRole::Customer => {
                let cutoff = Duration::minutes(settings.refund_policy_cutoff_minutes);
                let late = booking.scheduled_start.is_some_and(|s| s - now < cutoff);
                if late {
                    money::apply_fraction(paid, settings.refund_late_fraction)
                } else {
                    paid
                }
            }
        },
        // inquiry fee is kept once the inquiry has been paid for
        BookingState::InquiryPaid
        | BookingState::AwaitingQuote
        | BookingState::Quoted
        | BookingState::QuoteAccepted => match role {
            CancelRole::Admin => paid,
            CancelRole::Customer => Decimal::ZERO,
        },
        BookingState::Created | BookingState::Held => paid,
        _ => Decimal::ZERO,
    }
}
