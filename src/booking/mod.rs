//! Booking lifecycle
//!
//! Regular (fixed-price, slot held until paid) and inquiry (fee, quote,
//! then scheduled) bookings, worker assignments and their tracking
//! sessions.

pub mod db;
pub mod policy;
pub mod service;
pub mod state;
pub mod types;

pub use db::{BookingStore, PgBookingStore};
pub use service::{BookingService, DEFAULT_QUOTE_DURATION_MINUTES};
pub use state::{AssignmentState, BookingKind, BookingState};
pub use types::{
    AssignmentOutcome, AssignmentPatch, AssignmentTransition, Booking, BookingEvent,
    BookingOutcome, BookingPatch, BookingTransition, BookingWithPayment, Cancellation,
    CompletionReport, CreateBooking, NewBooking, ProvideQuote, Quote, QuoteDecision,
    TrackingSession, WorkerAssignment, new_booking_reference,
};
