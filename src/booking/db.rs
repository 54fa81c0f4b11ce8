//! Booking persistence
//!
//! State changes are compare-and-set under a row lock on the booking, and
//! write their audit row in the same transaction. The partial unique index
//! on `(service_id, scheduled_start, scheduled_end)` over slot-holding
//! states rejects a second hold on the same window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::str::FromStr;

use super::state::{AssignmentState, BookingKind, BookingState};
use super::types::{
    AssignmentOutcome, AssignmentTransition, Booking, BookingEvent, BookingOutcome,
    BookingTransition, Cancellation, CompletionReport, NewBooking, Quote, TrackingSession,
    WorkerAssignment,
};
use crate::account::{AddressSnapshot, ContactSnapshot};
use crate::availability::Occupancy;
use crate::core_types::{AssignmentId, BookingId, ServiceId, UserId};
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Insert and write the creation audit row.
    async fn insert(&self, booking: NewBooking, now: DateTime<Utc>) -> CoreResult<Booking>;

    async fn get(&self, id: BookingId) -> CoreResult<Option<Booking>>;

    async fn transition(
        &self,
        transition: BookingTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<BookingOutcome>;

    /// Scheduled bookings of `service_id` intersecting `[from, to)` in a
    /// calendar-occupying state.
    async fn occupancy(
        &self,
        service_id: ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<Occupancy>>;

    /// `held` bookings whose hold ended at or before `now`.
    async fn lapsed_holds(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>>;

    /// `quoted` bookings whose undecided quote expired at or before `now`.
    async fn lapsed_quotes(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>>;

    /// Newest first.
    async fn list_for_customer(&self, customer_id: UserId, limit: i64) -> CoreResult<Vec<Booking>>;

    /// Oldest first.
    async fn events(&self, booking_id: BookingId) -> CoreResult<Vec<BookingEvent>>;

    /// New `pending` assignment. Fails with `ConflictingTransition` while the
    /// booking is not `confirmed` or already has a non-terminal assignment.
    async fn insert_assignment(
        &self,
        booking_id: BookingId,
        worker_id: UserId,
        assigned_by: UserId,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkerAssignment>;

    async fn get_assignment(&self, id: AssignmentId) -> CoreResult<Option<WorkerAssignment>>;

    async fn active_assignment(&self, booking_id: BookingId)
    -> CoreResult<Option<WorkerAssignment>>;

    /// Newest first.
    async fn assignments_for_worker(
        &self,
        worker_id: UserId,
        limit: i64,
    ) -> CoreResult<Vec<WorkerAssignment>>;

    /// Assignment CAS. A carried booking transition must apply too, or
    /// nothing does (`ConflictingTransition`).
    async fn transition_assignment(
        &self,
        transition: AssignmentTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<AssignmentOutcome>;

    /// Open a tracking session and link it to the assignment.
    async fn open_tracking(
        &self,
        assignment: &WorkerAssignment,
        now: DateTime<Utc>,
    ) -> CoreResult<TrackingSession>;

    /// Close the assignment's open session, if any.
    async fn close_tracking(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TrackingSession>>;
}

pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const BOOKING_COLUMNS: &str = "id, reference, customer_id, service_id, kind, state, \
     scheduled_start, scheduled_end, address, contact, notes, hold_expires_at, quote, \
     payment_id, cancellation, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str = "id, booking_id, worker_id, assigned_by, state, assigned_at, \
     accepted_at, rejected_at, started_at, completed_at, rejection_reason, start_notes, \
     completion, tracking_session_id";

fn parse<T: FromStr<Err = String>>(raw: &str) -> CoreResult<T> {
    T::from_str(raw).map_err(CoreError::Internal)
}

fn booking_from_row(row: &PgRow) -> CoreResult<Booking> {
    Ok(Booking {
        id: row.get("id"),
        reference: row.get("reference"),
        customer_id: row.get("customer_id"),
        service_id: row.get("service_id"),
        kind: parse::<BookingKind>(row.get("kind"))?,
        state: parse::<BookingState>(row.get("state"))?,
        scheduled_start: row.get("scheduled_start"),
        scheduled_end: row.get("scheduled_end"),
        address: row.get::<Json<AddressSnapshot>, _>("address").0,
        contact: row.get::<Json<ContactSnapshot>, _>("contact").0,
        notes: row.get("notes"),
        hold_expires_at: row.get("hold_expires_at"),
        quote: row.get::<Option<Json<Quote>>, _>("quote").map(|j| j.0),
        payment_id: row.get("payment_id"),
        cancellation: row.get::<Option<Json<Cancellation>>, _>("cancellation").map(|j| j.0),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn assignment_from_row(row: &PgRow) -> CoreResult<WorkerAssignment> {
    Ok(WorkerAssignment {
        id: row.get("id"),
        booking_id: row.get("booking_id"),
        worker_id: row.get("worker_id"),
        assigned_by: row.get("assigned_by"),
        state: parse::<AssignmentState>(row.get("state"))?,
        assigned_at: row.get("assigned_at"),
        accepted_at: row.get("accepted_at"),
        rejected_at: row.get("rejected_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        rejection_reason: row.get("rejection_reason"),
        start_notes: row.get("start_notes"),
        completion: row.get::<Option<Json<CompletionReport>>, _>("completion").map(|j| j.0),
        tracking_session_id: row.get("tracking_session_id"),
    })
}

fn session_from_row(row: &PgRow) -> TrackingSession {
    TrackingSession {
        id: row.get("id"),
        assignment_id: row.get("assignment_id"),
        booking_id: row.get("booking_id"),
        worker_id: row.get("worker_id"),
        opened_at: row.get("opened_at"),
        closed_at: row.get("closed_at"),
    }
}

async fn insert_event_tx(
    conn: &mut PgConnection,
    booking_id: BookingId,
    actor_id: Option<UserId>,
    from: Option<BookingState>,
    to: BookingState,
    detail: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"INSERT INTO booking_events_tb (booking_id, actor_id, from_state, to_state, detail, created_at)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(booking_id)
    .bind(actor_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(detail)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Lock, compare, write. `Ok(Err(current))` when the state moved.
async fn transition_tx(
    conn: &mut PgConnection,
    t: &BookingTransition,
    now: DateTime<Utc>,
) -> CoreResult<Result<Booking, Booking>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM bookings_tb WHERE id = $1 FOR UPDATE",
        BOOKING_COLUMNS
    ))
    .bind(t.booking_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| CoreError::not_found(format!("booking {}", t.booking_id)))?;
    let mut booking = booking_from_row(&row)?;
    if booking.state != t.from {
        return Ok(Err(booking));
    }
    booking.apply(t, now);

    sqlx::query(
        r#"UPDATE bookings_tb
           SET state = $1, scheduled_start = $2, scheduled_end = $3, hold_expires_at = $4,
               quote = $5, payment_id = $6, cancellation = $7, updated_at = $8
           WHERE id = $9"#,
    )
    .bind(booking.state.as_str())
    .bind(booking.scheduled_start)
    .bind(booking.scheduled_end)
    .bind(booking.hold_expires_at)
    .bind(booking.quote.clone().map(Json))
    .bind(booking.payment_id)
    .bind(booking.cancellation.clone().map(Json))
    .bind(now)
    .bind(booking.id)
    .execute(&mut *conn)
    .await?;

    insert_event_tx(conn, booking.id, t.actor_id, Some(t.from), t.to, &t.detail, now).await?;
    Ok(Ok(booking))
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn insert(&self, b: NewBooking, now: DateTime<Utc>) -> CoreResult<Booking> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            r#"INSERT INTO bookings_tb
                   (reference, customer_id, service_id, kind, state, scheduled_start,
                    scheduled_end, address, contact, notes, hold_expires_at, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
               RETURNING {}"#,
            BOOKING_COLUMNS
        ))
        .bind(&b.reference)
        .bind(b.customer_id)
        .bind(b.service_id)
        .bind(b.kind.as_str())
        .bind(b.state.as_str())
        .bind(b.scheduled_start)
        .bind(b.scheduled_end)
        .bind(Json(&b.address))
        .bind(Json(&b.contact))
        .bind(&b.notes)
        .bind(b.hold_expires_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let booking = booking_from_row(&row)?;
        insert_event_tx(&mut tx, booking.id, Some(b.customer_id), None, b.state, "created", now)
            .await?;
        tx.commit().await?;
        Ok(booking)
    }

    async fn get(&self, id: BookingId) -> CoreResult<Option<Booking>> {
        let row = sqlx::query(&format!("SELECT {} FROM bookings_tb WHERE id = $1", BOOKING_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn transition(
        &self,
        t: BookingTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<BookingOutcome> {
        let mut tx = self.pool.begin().await?;
        match transition_tx(&mut tx, &t, now).await? {
            Ok(booking) => {
                tx.commit().await?;
                Ok(BookingOutcome::Applied(booking))
            }
            Err(current) => {
                tx.rollback().await?;
                Ok(BookingOutcome::Stale(current))
            }
        }
    }

    async fn occupancy(
        &self,
        service_id: ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<Occupancy>> {
        let rows = sqlx::query(
            r#"SELECT scheduled_start, scheduled_end, state, hold_expires_at
               FROM bookings_tb
               WHERE service_id = $1
                 AND scheduled_start < $3 AND scheduled_end > $2
                 AND state IN ('held', 'confirmed', 'assigned', 'in_progress', 'completed')
               ORDER BY scheduled_start"#,
        )
        .bind(service_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(Occupancy {
                    start: r.get("scheduled_start"),
                    end: r.get("scheduled_end"),
                    state: parse::<BookingState>(r.get("state"))?,
                    hold_expires_at: r.get("hold_expires_at"),
                })
            })
            .collect()
    }

    async fn lapsed_holds(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM bookings_tb
               WHERE state = 'held' AND hold_expires_at <= $1
               ORDER BY hold_expires_at LIMIT $2"#,
            BOOKING_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn lapsed_quotes(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM bookings_tb
               WHERE state = 'quoted'
                 AND (quote->>'decided_at') IS NULL
                 AND (quote->>'expires_at')::timestamptz <= $1
               ORDER BY id LIMIT $2"#,
            BOOKING_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn list_for_customer(&self, customer_id: UserId, limit: i64) -> CoreResult<Vec<Booking>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM bookings_tb WHERE customer_id = $1 ORDER BY id DESC LIMIT $2",
            BOOKING_COLUMNS
        ))
        .bind(customer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn events(&self, booking_id: BookingId) -> CoreResult<Vec<BookingEvent>> {
        let rows = sqlx::query(
            r#"SELECT id, booking_id, actor_id, from_state, to_state, detail, created_at
               FROM booking_events_tb WHERE booking_id = $1 ORDER BY id"#,
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(BookingEvent {
                    id: r.get("id"),
                    booking_id: r.get("booking_id"),
                    actor_id: r.get("actor_id"),
                    from_state: r
                        .get::<Option<&str>, _>("from_state")
                        .map(parse::<BookingState>)
                        .transpose()?,
                    to_state: parse::<BookingState>(r.get("to_state"))?,
                    detail: r.get("detail"),
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }

    async fn insert_assignment(
        &self,
        booking_id: BookingId,
        worker_id: UserId,
        assigned_by: UserId,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkerAssignment> {
        let mut tx = self.pool.begin().await?;
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM bookings_tb WHERE id = $1 FOR UPDATE")
                .bind(booking_id)
                .fetch_optional(&mut *tx)
                .await?;
        let state = state.ok_or_else(|| CoreError::not_found(format!("booking {}", booking_id)))?;
        if state != BookingState::Confirmed.as_str() {
            return Err(CoreError::conflict(format!(
                "booking {} is {}, workers are assigned to confirmed bookings",
                booking_id, state
            )));
        }

        // partial unique index on non-terminal assignments backs this up
        let row = sqlx::query(&format!(
            r#"INSERT INTO worker_assignments_tb (booking_id, worker_id, assigned_by, state, assigned_at)
               VALUES ($1, $2, $3, 'pending', $4)
               RETURNING {}"#,
            ASSIGNMENT_COLUMNS
        ))
        .bind(booking_id)
        .bind(worker_id)
        .bind(assigned_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let assignment = assignment_from_row(&row)?;
        tx.commit().await?;
        Ok(assignment)
    }

    async fn get_assignment(&self, id: AssignmentId) -> CoreResult<Option<WorkerAssignment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM worker_assignments_tb WHERE id = $1",
            ASSIGNMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn active_assignment(
        &self,
        booking_id: BookingId,
    ) -> CoreResult<Option<WorkerAssignment>> {
        let row = sqlx::query(&format!(
            r#"SELECT {} FROM worker_assignments_tb
               WHERE booking_id = $1 AND state IN ('pending', 'accepted', 'in_progress')"#,
            ASSIGNMENT_COLUMNS
        ))
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn assignments_for_worker(
        &self,
        worker_id: UserId,
        limit: i64,
    ) -> CoreResult<Vec<WorkerAssignment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM worker_assignments_tb WHERE worker_id = $1 ORDER BY id DESC LIMIT $2",
            ASSIGNMENT_COLUMNS
        ))
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn transition_assignment(
        &self,
        t: AssignmentTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<AssignmentOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM worker_assignments_tb WHERE id = $1 FOR UPDATE",
            ASSIGNMENT_COLUMNS
        ))
        .bind(t.assignment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("assignment {}", t.assignment_id)))?;
        let mut assignment = assignment_from_row(&row)?;
        if assignment.state != t.from {
            tx.rollback().await?;
            return Ok(AssignmentOutcome::Stale(assignment));
        }
        assignment.apply(&t, now);

        sqlx::query(
            r#"UPDATE worker_assignments_tb
               SET state = $1, accepted_at = $2, rejected_at = $3, started_at = $4,
                   completed_at = $5, rejection_reason = $6, start_notes = $7,
                   completion = $8, tracking_session_id = $9
               WHERE id = $10"#,
        )
        .bind(assignment.state.as_str())
        .bind(assignment.accepted_at)
        .bind(assignment.rejected_at)
        .bind(assignment.started_at)
        .bind(assignment.completed_at)
        .bind(&assignment.rejection_reason)
        .bind(&assignment.start_notes)
        .bind(assignment.completion.clone().map(Json))
        .bind(assignment.tracking_session_id)
        .bind(assignment.id)
        .execute(&mut *tx)
        .await?;

        let booking = match &t.booking {
            Some(bt) => match transition_tx(&mut tx, bt, now).await? {
                Ok(b) => Some(b),
                Err(current) => {
                    tx.rollback().await?;
                    return Err(CoreError::conflict(format!(
                        "booking {} is {}, expected {}",
                        current.id, current.state, bt.from
                    )));
                }
            },
            None => None,
        };

        tx.commit().await?;
        Ok(AssignmentOutcome::Applied {
            assignment,
            booking,
        })
    }

    async fn open_tracking(
        &self,
        assignment: &WorkerAssignment,
        now: DateTime<Utc>,
    ) -> CoreResult<TrackingSession> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"INSERT INTO tracking_sessions_tb (assignment_id, booking_id, worker_id, opened_at)
               VALUES ($1, $2, $3, $4)
               RETURNING id, assignment_id, booking_id, worker_id, opened_at, closed_at"#,
        )
        .bind(assignment.id)
        .bind(assignment.booking_id)
        .bind(assignment.worker_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let session = session_from_row(&row);
        sqlx::query("UPDATE worker_assignments_tb SET tracking_session_id = $1 WHERE id = $2")
            .bind(session.id)
            .bind(assignment.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn close_tracking(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TrackingSession>> {
        let row = sqlx::query(
            r#"UPDATE tracking_sessions_tb SET closed_at = $1
               WHERE assignment_id = $2 AND closed_at IS NULL
               RETURNING id, assignment_id, booking_id, worker_id, opened_at, closed_at"#,
        )
        .bind(now)
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }
}
