//! Booking State Machine
//!
//! Two tracks share one state column.
//!
//! ```text
//! regular:  created ─► held ─► confirmed ─► assigned ─► in_progress ─► completed
//!                       │
//!                       └─► expired
//!
//! inquiry:  created ─► inquiry_paid ─► awaiting_quote ─► quoted ─┬─► quote_accepted ─► held ─► confirmed ...
//!                           └──────────────────────────────► ┘   ├─► quote_rejected
//!                                                                └─► quote_expired
//! ```
//!
//! `cancelled` is reachable from every non-terminal state; who may cancel
//! what is decided by the booking service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingKind {
    Regular,
    Inquiry,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Regular => "regular",
            BookingKind::Inquiry => "inquiry",
        }
    }
}

impl fmt::Display for BookingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BookingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(BookingKind::Regular),
            "inquiry" => Ok(BookingKind::Inquiry),
            _ => Err(format!("Invalid booking kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    Created,
    Held,
    Confirmed,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
    Expired,
    InquiryPaid,
    AwaitingQuote,
    Quoted,
    QuoteAccepted,
    QuoteRejected,
    QuoteExpired,
}

impl BookingState {
    pub const ALL: [BookingState; 14] = [
        BookingState::Created,
        BookingState::Held,
        BookingState::Confirmed,
        BookingState::Assigned,
        BookingState::InProgress,
        BookingState::Completed,
        BookingState::Cancelled,
        BookingState::Expired,
        BookingState::InquiryPaid,
        BookingState::AwaitingQuote,
        BookingState::Quoted,
        BookingState::QuoteAccepted,
        BookingState::QuoteRejected,
        BookingState::QuoteExpired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingState::Created => "created",
            BookingState::Held => "held",
            BookingState::Confirmed => "confirmed",
            BookingState::Assigned => "assigned",
            BookingState::InProgress => "in_progress",
            BookingState::Completed => "completed",
            BookingState::Cancelled => "cancelled",
            BookingState::Expired => "expired",
            BookingState::InquiryPaid => "inquiry_paid",
            BookingState::AwaitingQuote => "awaiting_quote",
            BookingState::Quoted => "quoted",
            BookingState::QuoteAccepted => "quote_accepted",
            BookingState::QuoteRejected => "quote_rejected",
            BookingState::QuoteExpired => "quote_expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingState::Completed
                | BookingState::Cancelled
                | BookingState::Expired
                | BookingState::QuoteRejected
                | BookingState::QuoteExpired
        )
    }

    /// States covered by the one-active-booking-per-window constraint.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            BookingState::Held
                | BookingState::Confirmed
                | BookingState::Assigned
                | BookingState::InProgress
        )
    }

    /// States that make a window unavailable. Held bookings additionally
    /// need an unexpired hold, which the caller checks.
    pub fn occupies_calendar(&self) -> bool {
        self.holds_slot() || *self == BookingState::Completed
    }

    /// Inquiry bookings a customer may still walk away from.
    pub fn is_pre_schedule_inquiry(&self) -> bool {
        matches!(
            self,
            BookingState::Created
                | BookingState::InquiryPaid
                | BookingState::AwaitingQuote
                | BookingState::Quoted
                | BookingState::QuoteAccepted
        )
    }

    /// Forward edges of both tracks. Cancellation is handled separately.
    pub fn can_transition_to(&self, next: BookingState, kind: BookingKind) -> bool {
        use BookingState::*;
        if next == Cancelled {
            return !self.is_terminal();
        }
        match kind {
            BookingKind::Regular => matches!(
                (self, next),
                (Created, Held)
                    | (Held, Confirmed)
                    | (Held, Expired)
                    | (Confirmed, Assigned)
                    | (Assigned, Confirmed)
                    | (Assigned, InProgress)
                    | (InProgress, Completed)
            ),
            BookingKind::Inquiry => matches!(
                (self, next),
                (Created, InquiryPaid)
                    | (InquiryPaid, AwaitingQuote)
                    | (InquiryPaid, Quoted)
                    | (AwaitingQuote, Quoted)
                    | (Quoted, QuoteAccepted)
                    | (Quoted, QuoteRejected)
                    | (Quoted, QuoteExpired)
                    | (QuoteAccepted, Held)
                    | (Held, Confirmed)
                    | (Held, Expired)
                    | (Confirmed, Assigned)
                    | (Assigned, Confirmed)
                    | (Assigned, InProgress)
                    | (InProgress, Completed)
            ),
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BookingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid booking state: {}", s))
    }
}

/// Worker assignment sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Pending,
    Accepted,
    Rejected,
    InProgress,
    Completed,
}

impl AssignmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentState::Pending => "pending",
            AssignmentState::Accepted => "accepted",
            AssignmentState::Rejected => "rejected",
            AssignmentState::InProgress => "in_progress",
            AssignmentState::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentState::Rejected | AssignmentState::Completed)
    }

    pub fn can_transition_to(&self, next: AssignmentState) -> bool {
        use AssignmentState::*;
        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Rejected)
                | (Accepted, Rejected)
                | (Accepted, InProgress)
                | (InProgress, Completed)
        )
    }
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AssignmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssignmentState::Pending),
            "accepted" => Ok(AssignmentState::Accepted),
            "rejected" => Ok(AssignmentState::Rejected),
            "in_progress" => Ok(AssignmentState::InProgress),
            "completed" => Ok(AssignmentState::Completed),
            _ => Err(format!("Invalid assignment state: {}", s)),
        }
    }
}
