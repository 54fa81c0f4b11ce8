//! Booking, quote and assignment handlers

use std::sync::Arc;

use axum::{
    Extension,
    extract::{Path, Query, State},
};

use super::super::state::AppState;
use super::super::types::request::{
    AssignWorkerRequest, CompleteWorkRequest, CreateBookingRequest, ListParams,
    PaymentProofRequest, QuoteRequest, ReasonRequest, ScheduleRequest, SlotsParams,
    StartWorkRequest,
};
use super::super::types::{ApiResult, ValidatedJson, ok, parse_method};
use crate::auth::AuthUser;
use crate::availability::Slot;
use crate::booking::{
    Booking, BookingEvent, BookingWithPayment, CompletionReport, CreateBooking, ProvideQuote,
    WorkerAssignment,
};
use crate::core_types::{AssignmentId, BookingId};

pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    ValidatedJson(req): ValidatedJson<CreateBookingRequest>,
) -> ApiResult<BookingWithPayment> {
    let created = state
        .bookings
        .create(CreateBooking {
            customer_id: user.user_id,
            service_id: req.service_id,
            slot_start: req.slot_start,
            address_id: req.address_id,
            method: parse_method(&req.method),
            notes: req.notes,
        })
        .await?;
    ok(created)
}

pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<Booking>> {
    ok(state
        .bookings
        .list_for_customer(user.user_id, params.limit.unwrap_or(50))
        .await?)
}

pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
) -> ApiResult<Booking> {
    ok(state.bookings.get_for(user.user_id, id).await?)
}

pub async fn booking_events(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
) -> ApiResult<Vec<BookingEvent>> {
    ok(state.bookings.events(user.user_id, id).await?)
}

pub async fn available_slots(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SlotsParams>,
) -> ApiResult<Vec<Slot>> {
    ok(state
        .bookings
        .available_slots(params.service_id, params.date)
        .await?)
}

pub async fn verify_booking_payment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
    ValidatedJson(req): ValidatedJson<PaymentProofRequest>,
) -> ApiResult<Booking> {
    ok(state
        .bookings
        .verify_payment(user.user_id, id, &req.gateway_payment_id, &req.signature)
        .await?)
}

pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
    ValidatedJson(req): ValidatedJson<ReasonRequest>,
) -> ApiResult<Booking> {
    ok(state.bookings.cancel(user.user_id, id, &req.reason).await?)
}

// ============================================================================
// Quotes
// ============================================================================

pub async fn accept_quote(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
) -> ApiResult<Booking> {
    ok(state.bookings.accept_quote(user.user_id, id).await?)
}

pub async fn reject_quote(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
    ValidatedJson(req): ValidatedJson<ReasonRequest>,
) -> ApiResult<Booking> {
    ok(state
        .bookings
        .reject_quote(user.user_id, id, &req.reason)
        .await?)
}

pub async fn schedule_after_quote(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
    ValidatedJson(req): ValidatedJson<ScheduleRequest>,
) -> ApiResult<BookingWithPayment> {
    ok(state
        .bookings
        .schedule_after_quote(user.user_id, id, req.slot_start, parse_method(&req.method))
        .await?)
}

fn quote_request(admin_id: i64, booking_id: BookingId, req: QuoteRequest) -> ProvideQuote {
    ProvideQuote {
        admin_id,
        booking_id,
        amount: req.amount,
        notes: req.notes,
        ttl_hours: req.ttl_hours,
        duration_minutes: req.duration_minutes,
    }
}

pub async fn mark_awaiting_quote(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
) -> ApiResult<Booking> {
    ok(state.bookings.mark_awaiting_quote(user.user_id, id).await?)
}

pub async fn provide_quote(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
    ValidatedJson(req): ValidatedJson<QuoteRequest>,
) -> ApiResult<Booking> {
    ok(state
        .bookings
        .provide_quote(quote_request(user.user_id, id, req))
        .await?)
}

pub async fn update_quote(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
    ValidatedJson(req): ValidatedJson<QuoteRequest>,
) -> ApiResult<Booking> {
    ok(state
        .bookings
        .update_quote(quote_request(user.user_id, id, req))
        .await?)
}

// ============================================================================
// Assignments
// ============================================================================

pub async fn assign_worker(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<BookingId>,
    ValidatedJson(req): ValidatedJson<AssignWorkerRequest>,
) -> ApiResult<WorkerAssignment> {
    ok(state
        .bookings
        .assign_worker(user.user_id, id, req.worker_id)
        .await?)
}

pub async fn list_assignments(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<WorkerAssignment>> {
    ok(state
        .bookings
        .assignments_for_worker(user.user_id, params.limit.unwrap_or(50))
        .await?)
}

pub async fn accept_assignment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<AssignmentId>,
) -> ApiResult<WorkerAssignment> {
    ok(state.bookings.accept_assignment(user.user_id, id).await?)
}

pub async fn reject_assignment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<AssignmentId>,
    ValidatedJson(req): ValidatedJson<ReasonRequest>,
) -> ApiResult<WorkerAssignment> {
    ok(state
        .bookings
        .reject_assignment(user.user_id, id, &req.reason)
        .await?)
}

pub async fn start_work(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<AssignmentId>,
    ValidatedJson(req): ValidatedJson<StartWorkRequest>,
) -> ApiResult<WorkerAssignment> {
    ok(state.bookings.start_work(user.user_id, id, &req.notes).await?)
}

pub async fn complete_work(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<AssignmentId>,
    ValidatedJson(req): ValidatedJson<CompleteWorkRequest>,
) -> ApiResult<WorkerAssignment> {
    let report = CompletionReport {
        notes: req.notes,
        materials_used: req.materials_used,
        photos: req.photos,
    };
    ok(state.bookings.complete_work(user.user_id, id, report).await?)
}
