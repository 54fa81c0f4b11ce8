//! Booking Service
//!
//! Drives both booking tracks through their state machine. Every state
//! change is a compare-and-set in the store that writes its own audit row;
//! this layer decides which change is allowed, moves the money through
//! [`PaymentService`] and tells the people involved.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::{Arc, Weak};

use super::db::BookingStore;
use super::policy::{self, CancelRole};
use super::state::{AssignmentState, BookingKind, BookingState};
use super::types::{
    AssignmentOutcome, AssignmentPatch, AssignmentTransition, Booking, BookingEvent,
    BookingOutcome, BookingTransition, BookingWithPayment, Cancellation, CompletionReport,
    CreateBooking, NewBooking, ProvideQuote, Quote, QuoteDecision, WorkerAssignment,
    new_booking_reference,
};
use crate::account::{AccountService, ActorKind, ContactSnapshot};
use crate::availability::{self, Slot};
use crate::core_types::{AssignmentId, BookingId, ServiceId, UserId};
use crate::env::Environment;
use crate::error::{CoreError, CoreResult};
use crate::money;
use crate::notifications::{NewNotification, NotificationKind, NotificationService};
use crate::payments::{
    CreateOrder, OrderCreated, Payment, PaymentKind, PaymentListener, PaymentMethod,
    PaymentRelation, PaymentService, PaymentStatus,
};
use crate::presence::ChannelEvent;

/// Visit length assumed for a quote that does not state one
pub const DEFAULT_QUOTE_DURATION_MINUTES: i64 = 60;

/// Batch size of the expiry sweeps
const SWEEP_BATCH: i64 = 500;

pub struct BookingService {
    env: Environment,
    store: Arc<dyn BookingStore>,
    accounts: Arc<AccountService>,
    payments: Arc<PaymentService>,
    notifications: Arc<NotificationService>,
}

impl BookingService {
    /// Builds the service and subscribes it to payment completions.
    pub fn new(
        env: Environment,
        store: Arc<dyn BookingStore>,
        accounts: Arc<AccountService>,
        payments: Arc<PaymentService>,
        notifications: Arc<NotificationService>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            env,
            store,
            accounts,
            payments,
            notifications,
        });
        service
            .payments
            .add_listener(Arc::new(BookingPaymentListener {
                bookings: Arc::downgrade(&service),
            }));
        service
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn load(&self, id: BookingId) -> CoreResult<Booking> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("booking {}", id)))
    }

    async fn owned(&self, customer_id: UserId, id: BookingId) -> CoreResult<Booking> {
        let booking = self.load(id).await?;
        if booking.customer_id != customer_id {
            return Err(CoreError::forbidden(format!("booking {} is not yours", id)));
        }
        Ok(booking)
    }

    /// Booking visible to its customer, its assigned worker and admins.
    pub async fn get_for(&self, user_id: UserId, id: BookingId) -> CoreResult<Booking> {
        let booking = self.load(id).await?;
        if booking.customer_id == user_id {
            return Ok(booking);
        }
        let actor = self.accounts.actor(user_id).await?;
        if actor.is_admin() {
            return Ok(booking);
        }
        if actor.kind == ActorKind::Worker {
            let assigned = self
                .store
                .active_assignment(id)
                .await?
                .is_some_and(|a| a.worker_id == user_id);
            if assigned {
                return Ok(booking);
            }
        }
        Err(CoreError::forbidden(format!("booking {} is not visible to user {}", id, user_id)))
    }

    pub async fn list_for_customer(&self, customer_id: UserId, limit: i64) -> CoreResult<Vec<Booking>> {
        self.store
            .list_for_customer(customer_id, limit.clamp(1, 200))
            .await
    }

    /// Audit trail, oldest first.
    pub async fn events(&self, user_id: UserId, id: BookingId) -> CoreResult<Vec<BookingEvent>> {
        self.get_for(user_id, id).await?;
        self.store.events(id).await
    }

    pub async fn assignments_for_worker(
        &self,
        worker_id: UserId,
        limit: i64,
    ) -> CoreResult<Vec<WorkerAssignment>> {
        self.accounts.require_kind(worker_id, ActorKind::Worker).await?;
        self.store
            .assignments_for_worker(worker_id, limit.clamp(1, 200))
            .await
    }

    /// Free slots of a fixed-price service on a business-local date.
    pub async fn available_slots(&self, service_id: ServiceId, date: NaiveDate) -> CoreResult<Vec<Slot>> {
        let service = self.accounts.active_service(service_id).await?;
        let (_, duration) = service.fixed_terms().ok_or_else(|| {
            CoreError::validation(format!(
                "service {} is priced on inquiry, slots are offered after a quote",
                service_id
            ))
        })?;
        let settings = self.env.settings.booking().await;
        let (open, close) = availability::working_window(&settings, date)?;
        let occupied = self.store.occupancy(service_id, open, close).await?;
        availability::free_slots(&settings, duration, date, &occupied, self.env.now())
    }

    async fn claim_slot(
        &self,
        service_id: ServiceId,
        duration_minutes: i64,
        start: chrono::DateTime<chrono::Utc>,
    ) -> CoreResult<Slot> {
        let settings = self.env.settings.booking().await;
        let date = availability::business_date(&settings, start)?;
        let (open, close) = availability::working_window(&settings, date)?;
        let occupied = self.store.occupancy(service_id, open, close).await?;
        availability::find_slot(&settings, duration_minutes, start, &occupied, self.env.now())
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Checked CAS. Same-state transitions only patch fields.
    async fn commit(&self, booking: &Booking, t: BookingTransition) -> CoreResult<Booking> {
        if t.from != t.to && !t.from.can_transition_to(t.to, booking.kind) {
            return Err(CoreError::conflict(format!(
                "booking {} cannot move from {} to {}",
                booking.id, t.from, t.to
            )));
        }
        self.apply(t).await
    }

    async fn apply(&self, t: BookingTransition) -> CoreResult<Booking> {
        let from = t.from;
        let actor_id = t.actor_id;
        let detail = t.detail.clone();
        match self.store.transition(t, self.env.now()).await? {
            BookingOutcome::Applied(booking) => {
                self.published(&booking, from, actor_id, &detail);
                Ok(booking)
            }
            BookingOutcome::Stale(current) => Err(CoreError::conflict(format!(
                "booking {} is {}, expected {}",
                current.id, current.state, from
            ))),
        }
    }

    fn published(&self, booking: &Booking, from: BookingState, actor_id: Option<UserId>, detail: &str) {
        tracing::info!(
            target: "AUDIT",
            booking_id = booking.id,
            reference = %booking.reference,
            from = %from,
            to = %booking.state,
            actor_id = ?actor_id,
            detail,
            "Booking transition"
        );
        let event = ChannelEvent::BookingUpdate {
            booking_id: booking.id,
            reference: booking.reference.clone(),
            state: booking.state.as_str().to_string(),
        };
        self.notifications.hub().unicast(booking.customer_id, event.clone());
        self.notifications.broadcast_admin(event);
    }

    async fn notify(&self, user_id: UserId, kind: NotificationKind, title: &str, body: String, booking: &Booking) {
        let n = NewNotification::new(user_id, kind, title, body).with_data(json!({
            "booking_id": booking.id,
            "reference": booking.reference,
            "state": booking.state.as_str(),
        }));
        if let Err(e) = self.notifications.create(n).await {
            tracing::error!(user_id, booking_id = booking.id, error = %e, "Failed to notify");
        }
    }

    async fn notify_admins(&self, kind: NotificationKind, title: &str, body: String, booking: &Booking) {
        let admins = match self.accounts.admin_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(booking_id = booking.id, error = %e, "Failed to load admins");
                return;
            }
        };
        let data = json!({
            "booking_id": booking.id,
            "reference": booking.reference,
            "state": booking.state.as_str(),
        });
        let items = admins
            .into_iter()
            .map(|id| NewNotification::new(id, kind, title, body.clone()).with_data(data.clone()))
            .collect();
        self.notifications.create_many(items).await;
    }

    // ========================================================================
    // Creation and payment
    // ========================================================================

    /// Create a booking and open the payment it waits on.
    ///
    /// Fixed-price services hold the requested slot for
    /// `booking_hold_time_minutes`; inquiry services start unscheduled and
    /// charge `inquiry_booking_fee`. Wallet payments complete inline, so the
    /// returned booking is already `confirmed` / `inquiry_paid` for them.
    pub async fn create(&self, req: CreateBooking) -> CoreResult<BookingWithPayment> {
        let customer = self
            .accounts
            .require_kind(req.customer_id, ActorKind::Customer)
            .await?;
        let service = self.accounts.active_service(req.service_id).await?;
        let address = self
            .accounts
            .store()
            .get_address(customer.id, req.address_id)
            .await?
            .ok_or_else(|| {
                CoreError::validation(format!(
                    "address {} does not belong to user {}",
                    req.address_id, customer.id
                ))
            })?;
        let notes = req.notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        let settings = self.env.settings.booking().await;
        let now = self.env.now();

        let (new, amount) = match service.fixed_terms() {
            Some((price, duration)) => {
                let start = req
                    .slot_start
                    .ok_or_else(|| CoreError::validation("a slot is required for this service"))?;
                let slot = self.claim_slot(service.id, duration, start).await?;
                let new = NewBooking {
                    reference: new_booking_reference(),
                    customer_id: customer.id,
                    service_id: service.id,
                    kind: BookingKind::Regular,
                    state: BookingState::Held,
                    scheduled_start: Some(slot.start),
                    scheduled_end: Some(slot.end),
                    address,
                    contact: ContactSnapshot::from(&customer),
                    notes,
                    hold_expires_at: Some(now + Duration::minutes(settings.booking_hold_time_minutes)),
                };
                (new, price)
            }
            None => {
                let new = NewBooking {
                    reference: new_booking_reference(),
                    customer_id: customer.id,
                    service_id: service.id,
                    kind: BookingKind::Inquiry,
                    state: BookingState::Created,
                    scheduled_start: None,
                    scheduled_end: None,
                    address,
                    contact: ContactSnapshot::from(&customer),
                    notes,
                    hold_expires_at: None,
                };
                (new, settings.inquiry_booking_fee)
            }
        };

        let booking = match self.store.insert(new.clone(), now).await {
            Ok(b) => b,
            // a lapsed hold not yet swept still owns the slot row
            Err(CoreError::ConflictingTransition(_)) if new.state == BookingState::Held => {
                self.expire_holds().await?;
                self.store.insert(new, now).await?
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            target: "AUDIT",
            booking_id = booking.id,
            reference = %booking.reference,
            customer_id = booking.customer_id,
            service_id = booking.service_id,
            kind = %booking.kind,
            state = %booking.state,
            "Booking created"
        );

        let order = match self
            .open_payment(&booking, PaymentKind::Booking, amount, req.method)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.abandon(&booking, &e).await;
                return Err(e);
            }
        };
        let booking = self.attach_payment(booking, &order).await?;
        if booking.state == BookingState::Held {
            let body = format!(
                "Complete payment within {} minutes to confirm {}",
                settings.booking_hold_time_minutes, booking.reference
            );
            self.notify(booking.customer_id, NotificationKind::BookingCreated, "Slot held", body, &booking)
                .await;
        }
        Ok(BookingWithPayment { booking, order })
    }

    async fn open_payment(
        &self,
        booking: &Booking,
        kind: PaymentKind,
        amount: Decimal,
        method: PaymentMethod,
    ) -> CoreResult<OrderCreated> {
        self.payments
            .create_order(CreateOrder {
                user_id: booking.customer_id,
                kind,
                method,
                amount,
                relation: Some(PaymentRelation::Booking(booking.id)),
                description: Some(format!("{} {}", kind, booking.reference)),
            })
            .await
    }

    /// Records a still-pending payment on the booking. Completed (wallet)
    /// payments were already recorded by the listener.
    async fn attach_payment(&self, booking: Booking, order: &OrderCreated) -> CoreResult<Booking> {
        if order.payment.status == PaymentStatus::Completed {
            return self.load(booking.id).await;
        }
        let t = BookingTransition::new(booking.id, booking.state, booking.state)
            .payment(order.payment.id)
            .detail(format!("payment {} opened", order.payment.reference));
        self.commit(&booking, t).await
    }

    /// A freshly created booking whose payment could not be opened.
    async fn abandon(&self, booking: &Booking, cause: &CoreError) {
        let t = BookingTransition::new(booking.id, booking.state, BookingState::Cancelled)
            .detail(format!("payment could not be opened: {}", cause))
            .hold_until(None)
            .cancellation(Cancellation {
                actor_id: booking.customer_id,
                reason: "payment could not be opened".into(),
                refund_ledger_id: None,
                refund_amount: None,
                cancelled_at: self.env.now(),
            });
        if let Err(e) = self.commit(booking, t).await {
            tracing::error!(booking_id = booking.id, error = %e, "Failed to release abandoned booking");
        }
    }

    /// Checkout callback for the booking's open payment.
    ///
    /// A capture that lands after the hold lapsed is refunded to the wallet
    /// and reported as `ConflictingTransition`.
    pub async fn verify_payment(
        &self,
        user_id: UserId,
        booking_id: BookingId,
        gateway_payment_id: &str,
        signature: &str,
    ) -> CoreResult<Booking> {
        let booking = self.get_for(user_id, booking_id).await?;
        let payment_id = booking
            .payment_id
            .ok_or_else(|| CoreError::validation(format!("booking {} has no open payment", booking_id)))?;
        self.payments
            .verify_and_complete(payment_id, gateway_payment_id, signature)
            .await?;
        let booking = self.load(booking_id).await?;
        if booking.state == BookingState::Expired {
            return Err(CoreError::conflict(format!(
                "hold on booking {} expired, payment refunded to wallet",
                booking.reference
            )));
        }
        Ok(booking)
    }

    /// Payment kind that moves a booking of `kind` out of `held`.
    fn slot_payment_kind(kind: BookingKind) -> PaymentKind {
        match kind {
            BookingKind::Regular => PaymentKind::Booking,
            BookingKind::Inquiry => PaymentKind::Quote,
        }
    }

    async fn on_payment_completed(&self, booking_id: BookingId, payment: &Payment) -> CoreResult<()> {
        let booking = self.load(booking_id).await?;
        let now = self.env.now();
        let slot_kind = Self::slot_payment_kind(booking.kind);

        match booking.state {
            BookingState::Created
                if booking.kind == BookingKind::Inquiry && payment.kind == PaymentKind::Booking =>
            {
                let t = BookingTransition::new(booking.id, BookingState::Created, BookingState::InquiryPaid)
                    .by(payment.user_id)
                    .payment(payment.id)
                    .detail(format!("inquiry fee {} paid", payment.reference));
                let paid = self.commit(&booking, t).await?;
                self.notify_admins(
                    NotificationKind::InquiryReceived,
                    "New inquiry",
                    format!("Inquiry {} is waiting for a quote", paid.reference),
                    &paid,
                )
                .await;
                Ok(())
            }
            BookingState::Held if payment.kind == slot_kind && !booking.hold_lapsed(payment.updated_at) => {
                let t = BookingTransition::new(booking.id, BookingState::Held, BookingState::Confirmed)
                    .by(payment.user_id)
                    .payment(payment.id)
                    .hold_until(None)
                    .detail(format!("payment {} completed", payment.reference));
                match self.store.transition(t.clone(), now).await? {
                    BookingOutcome::Applied(confirmed) => {
                        self.published(&confirmed, BookingState::Held, t.actor_id, &t.detail);
                        self.notify(
                            confirmed.customer_id,
                            NotificationKind::BookingConfirmed,
                            "Booking confirmed",
                            format!("{} is confirmed", confirmed.reference),
                            &confirmed,
                        )
                        .await;
                        self.notify_admins(
                            NotificationKind::BookingConfirmed,
                            "Booking confirmed",
                            format!("{} needs a worker", confirmed.reference),
                            &confirmed,
                        )
                        .await;
                        Ok(())
                    }
                    // the sweep won the race
                    BookingOutcome::Stale(current) if current.state == BookingState::Expired => {
                        self.refund_late_capture(&current, payment).await
                    }
                    BookingOutcome::Stale(current) => Err(CoreError::conflict(format!(
                        "booking {} is {}, expected held",
                        current.id, current.state
                    ))),
                }
            }
            BookingState::Held if payment.kind == slot_kind => {
                let t = BookingTransition::new(booking.id, BookingState::Held, BookingState::Expired)
                    .payment(payment.id)
                    .detail(format!("payment {} arrived after hold lapsed", payment.reference));
                let expired = match self.store.transition(t.clone(), now).await? {
                    BookingOutcome::Applied(b) => {
                        self.published(&b, BookingState::Held, None, &t.detail);
                        b
                    }
                    BookingOutcome::Stale(current) => current,
                };
                if expired.state == BookingState::Expired {
                    self.refund_late_capture(&expired, payment).await
                } else {
                    Ok(())
                }
            }
            BookingState::Expired if payment.kind == slot_kind => {
                self.refund_late_capture(&booking, payment).await
            }
            BookingState::Cancelled
                if booking.payment_id == Some(payment.id)
                    && booking.cancellation.as_ref().is_none_or(|c| c.refund_amount.is_none()) =>
            {
                self.refund_late_capture(&booking, payment).await
            }
            state => {
                tracing::debug!(
                    booking_id,
                    payment_id = payment.id,
                    state = %state,
                    "Payment completion needs no booking change"
                );
                Ok(())
            }
        }
    }

    /// Full refund of a capture that arrived for an expired or cancelled
    /// booking.
    async fn refund_late_capture(&self, booking: &Booking, payment: &Payment) -> CoreResult<()> {
        let notes = format!("{} is {} at capture", booking.reference, booking.state);
        match self.payments.refund(payment.id, None, &notes).await {
            Ok(r) => {
                tracing::warn!(
                    target: "AUDIT",
                    booking_id = booking.id,
                    state = %booking.state,
                    payment_id = payment.id,
                    refund_payment_id = r.refund.id,
                    amount = %r.refund.amount,
                    "Late capture refunded"
                );
                let t = BookingTransition::new(booking.id, booking.state, booking.state)
                    .detail(format!("late payment {} refunded as {}", payment.reference, r.refund.reference));
                self.apply(t).await?;
                let (kind, body) = match booking.state {
                    BookingState::Expired => (
                        NotificationKind::HoldExpiredRefunded,
                        format!(
                            "Your hold on {} expired before payment arrived. {} was returned to your wallet.",
                            booking.reference, r.refund.amount
                        ),
                    ),
                    _ => (
                        NotificationKind::PaymentRefunded,
                        format!(
                            "{} was cancelled before payment arrived. {} was returned to your wallet.",
                            booking.reference, r.refund.amount
                        ),
                    ),
                };
                self.notify(booking.customer_id, kind, "Payment refunded", body, booking)
                    .await;
                Ok(())
            }
            Err(CoreError::AlreadyTerminal(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_payment_cancelled(&self, booking_id: BookingId, payment: &Payment) -> CoreResult<()> {
        let booking = self.load(booking_id).await?;
        let now = self.env.now();
        if booking.state != BookingState::Held
            || booking.payment_id != Some(payment.id)
            || booking.hold_lapsed(now)
        {
            return Ok(());
        }
        let t = BookingTransition::new(booking.id, BookingState::Held, BookingState::Held)
            .by(payment.user_id)
            .hold_until(Some(now))
            .detail(format!("payment {} cancelled, hold released", payment.reference));
        self.commit(&booking, t).await?;
        Ok(())
    }

    /// Sweep: `held` bookings whose hold lapsed.
    ///
    /// A hold whose payment completed without moving the booking is handed
    /// back to the completion hook, which confirms it if the capture beat
    /// the hold and expires and refunds it otherwise.
    pub async fn expire_holds(&self) -> CoreResult<usize> {
        let now = self.env.now();
        let lapsed = self.store.lapsed_holds(now, SWEEP_BATCH).await?;
        let mut expired = 0;
        for booking in lapsed {
            if let Some(payment_id) = booking.payment_id {
                let payment = self.payments.get(payment_id).await?;
                if payment.status == PaymentStatus::Completed
                    && payment.kind == Self::slot_payment_kind(booking.kind)
                {
                    if let Err(e) = self.on_payment_completed(booking.id, &payment).await {
                        tracing::error!(booking_id = booking.id, payment_id, error = %e, "Failed to settle captured hold");
                    } else if self.load(booking.id).await?.state == BookingState::Expired {
                        expired += 1;
                    }
                    continue;
                }
            }
            let t = BookingTransition::new(booking.id, BookingState::Held, BookingState::Expired)
                .detail("hold expired");
            match self.commit(&booking, t).await {
                Ok(b) => {
                    expired += 1;
                    self.notify(
                        b.customer_id,
                        NotificationKind::BookingExpired,
                        "Hold expired",
                        format!("The slot held for {} was released", b.reference),
                        &b,
                    )
                    .await;
                }
                Err(CoreError::ConflictingTransition(msg)) => {
                    tracing::debug!(booking_id = booking.id, reason = %msg, "Hold changed before expiry");
                }
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expired lapsed holds");
        }
        Ok(expired)
    }

    // ========================================================================
    // Quotes
    // ========================================================================

    /// Admin marks a paid inquiry as being worked on.
    pub async fn mark_awaiting_quote(&self, admin_id: UserId, booking_id: BookingId) -> CoreResult<Booking> {
        self.accounts.require_admin(admin_id).await?;
        let booking = self.load(booking_id).await?;
        let t = BookingTransition::new(booking.id, booking.state, BookingState::AwaitingQuote)
            .by(admin_id)
            .detail("awaiting quote");
        self.commit(&booking, t).await
    }

    /// Quote a paid inquiry, or revise a quote the customer has not decided on.
    pub async fn provide_quote(&self, req: ProvideQuote) -> CoreResult<Booking> {
        self.accounts.require_admin(req.admin_id).await?;
        let booking = self.load(req.booking_id).await?;
        if booking.kind != BookingKind::Inquiry {
            return Err(CoreError::validation(format!(
                "booking {} has a fixed price",
                booking.id
            )));
        }
        match booking.state {
            BookingState::InquiryPaid | BookingState::AwaitingQuote => {}
            BookingState::Quoted if booking.quote.as_ref().is_some_and(|q| !q.is_decided()) => {}
            other => {
                return Err(CoreError::conflict(format!(
                    "booking {} is {}, cannot be quoted",
                    booking.id, other
                )));
            }
        }

        let amount = money::normalize_positive(req.amount)?;
        let settings = self.env.settings.booking().await;
        let ttl_hours = req.ttl_hours.unwrap_or(settings.quote_ttl_hours);
        if ttl_hours <= 0 {
            return Err(CoreError::validation("quote validity must be positive"));
        }
        let duration_minutes = req.duration_minutes.unwrap_or(DEFAULT_QUOTE_DURATION_MINUTES);
        if duration_minutes <= 0 {
            return Err(CoreError::validation("quoted duration must be positive"));
        }
        let now = self.env.now();
        let quote = Quote {
            amount,
            notes: req.notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            duration_minutes,
            provided_by: req.admin_id,
            provided_at: now,
            expires_at: now + Duration::hours(ttl_hours),
            decided_at: None,
            decision: None,
            reject_reason: None,
        };
        let revised = booking.state == BookingState::Quoted;
        let t = BookingTransition::new(booking.id, booking.state, BookingState::Quoted)
            .by(req.admin_id)
            .quote(quote.clone())
            .detail(format!(
                "{} {} valid until {}",
                if revised { "quote revised to" } else { "quoted" },
                amount,
                quote.expires_at
            ));
        let quoted = self.commit(&booking, t).await?;
        self.notify(
            quoted.customer_id,
            NotificationKind::QuoteProvided,
            if revised { "Quote updated" } else { "Your quote is ready" },
            format!(
                "{} for {}, valid until {}",
                amount,
                quoted.reference,
                quote.expires_at.format("%Y-%m-%d %H:%M UTC")
            ),
            &quoted,
        )
        .await;
        Ok(quoted)
    }

    /// Revise an undecided quote.
    pub async fn update_quote(&self, req: ProvideQuote) -> CoreResult<Booking> {
        let booking = self.load(req.booking_id).await?;
        if booking.state != BookingState::Quoted {
            return Err(CoreError::conflict(format!(
                "booking {} is {}, only quoted bookings can be revised",
                booking.id, booking.state
            )));
        }
        self.provide_quote(req).await
    }

    fn open_quote(booking: &Booking, now: chrono::DateTime<chrono::Utc>) -> CoreResult<Quote> {
        if booking.state != BookingState::Quoted {
            return Err(CoreError::conflict(format!(
                "booking {} is {}, not quoted",
                booking.id, booking.state
            )));
        }
        let quote = booking
            .quote
            .clone()
            .ok_or_else(|| CoreError::internal(format!("quoted booking {} has no quote", booking.id)))?;
        if quote.is_decided() {
            return Err(CoreError::conflict("quote already decided"));
        }
        if quote.is_expired(now) {
            return Err(CoreError::conflict(format!(
                "quote expired at {}",
                quote.expires_at
            )));
        }
        Ok(quote)
    }

    pub async fn accept_quote(&self, customer_id: UserId, booking_id: BookingId) -> CoreResult<Booking> {
        let booking = self.owned(customer_id, booking_id).await?;
        let now = self.env.now();
        let mut quote = Self::open_quote(&booking, now)?;
        quote.decided_at = Some(now);
        quote.decision = Some(QuoteDecision::Accepted);

        let t = BookingTransition::new(booking.id, BookingState::Quoted, BookingState::QuoteAccepted)
            .by(customer_id)
            .quote(quote)
            .detail("quote accepted");
        let accepted = self.commit(&booking, t).await?;
        self.notify_admins(
            NotificationKind::QuoteAccepted,
            "Quote accepted",
            format!("{} accepted its quote", accepted.reference),
            &accepted,
        )
        .await;
        Ok(accepted)
    }

    pub async fn reject_quote(
        &self,
        customer_id: UserId,
        booking_id: BookingId,
        reason: &str,
    ) -> CoreResult<Booking> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CoreError::validation("a reason is required to reject a quote"));
        }
        let booking = self.owned(customer_id, booking_id).await?;
        let now = self.env.now();
        let mut quote = Self::open_quote(&booking, now)?;
        quote.decided_at = Some(now);
        quote.decision = Some(QuoteDecision::Rejected);
        quote.reject_reason = Some(reason.to_string());

        let t = BookingTransition::new(booking.id, BookingState::Quoted, BookingState::QuoteRejected)
            .by(customer_id)
            .quote(quote)
            .detail(format!("quote rejected: {}", reason));
        let rejected = self.commit(&booking, t).await?;
        self.notify_admins(
            NotificationKind::QuoteRejected,
            "Quote rejected",
            format!("{} rejected its quote: {}", rejected.reference, reason),
            &rejected,
        )
        .await;
        Ok(rejected)
    }

    /// Pick a slot for an accepted quote and open the quote payment.
    pub async fn schedule_after_quote(
        &self,
        customer_id: UserId,
        booking_id: BookingId,
        slot_start: chrono::DateTime<chrono::Utc>,
        method: PaymentMethod,
    ) -> CoreResult<BookingWithPayment> {
        let booking = self.owned(customer_id, booking_id).await?;
        if booking.state != BookingState::QuoteAccepted {
            return Err(CoreError::conflict(format!(
                "booking {} is {}, accept the quote first",
                booking.id, booking.state
            )));
        }
        let quote = booking
            .quote
            .clone()
            .ok_or_else(|| CoreError::internal(format!("accepted booking {} has no quote", booking.id)))?;
        let slot = self
            .claim_slot(booking.service_id, quote.duration_minutes, slot_start)
            .await?;
        let settings = self.env.settings.booking().await;
        let hold_until = self.env.now() + Duration::minutes(settings.booking_hold_time_minutes);

        let t = BookingTransition::new(booking.id, BookingState::QuoteAccepted, BookingState::Held)
            .by(customer_id)
            .schedule(slot.start, slot.end)
            .hold_until(Some(hold_until))
            .detail(format!("scheduled for {}", slot.start));
        let held = self.commit(&booking, t).await?;

        let order = match self
            .open_payment(&held, PaymentKind::Quote, quote.amount, method)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                let revert = BookingTransition::new(held.id, BookingState::Held, BookingState::QuoteAccepted)
                    .clear_schedule()
                    .hold_until(None)
                    .detail(format!("payment could not be opened: {}", e));
                if let Err(re) = self.apply(revert).await {
                    tracing::error!(booking_id = held.id, error = %re, "Failed to release slot after payment error");
                }
                return Err(e);
            }
        };
        let booking = self.attach_payment(held, &order).await?;
        Ok(BookingWithPayment { booking, order })
    }

    /// Sweep: undecided quotes past their validity.
    pub async fn expire_quotes(&self) -> CoreResult<usize> {
        let now = self.env.now();
        let lapsed = self.store.lapsed_quotes(now, SWEEP_BATCH).await?;
        let mut expired = 0;
        for booking in lapsed {
            let t = BookingTransition::new(booking.id, BookingState::Quoted, BookingState::QuoteExpired)
                .detail("quote expired");
            match self.commit(&booking, t).await {
                Ok(b) => {
                    expired += 1;
                    self.notify(
                        b.customer_id,
                        NotificationKind::QuoteExpired,
                        "Quote expired",
                        format!("The quote for {} is no longer valid", b.reference),
                        &b,
                    )
                    .await;
                }
                Err(CoreError::ConflictingTransition(msg)) => {
                    tracing::debug!(booking_id = booking.id, reason = %msg, "Quote changed before expiry");
                }
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expired lapsed quotes");
        }
        Ok(expired)
    }

    // ========================================================================
    // Worker assignments
    // ========================================================================

    pub async fn assign_worker(
        &self,
        admin_id: UserId,
        booking_id: BookingId,
        worker_id: UserId,
    ) -> CoreResult<WorkerAssignment> {
        self.accounts.require_admin(admin_id).await?;
        self.accounts.require_kind(worker_id, ActorKind::Worker).await?;
        let booking = self.load(booking_id).await?;
        let assignment = self
            .store
            .insert_assignment(booking.id, worker_id, admin_id, self.env.now())
            .await?;
        tracing::info!(
            target: "AUDIT",
            booking_id,
            assignment_id = assignment.id,
            worker_id,
            admin_id,
            "Worker assigned"
        );
        self.notify(
            worker_id,
            NotificationKind::WorkerAssigned,
            "New assignment",
            format!("You have been assigned to {}", booking.reference),
            &booking,
        )
        .await;
        Ok(assignment)
    }

    async fn worker_assignment(&self, worker_id: UserId, id: AssignmentId) -> CoreResult<WorkerAssignment> {
        let assignment = self
            .store
            .get_assignment(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("assignment {}", id)))?;
        if assignment.worker_id != worker_id {
            return Err(CoreError::forbidden(format!("assignment {} is not yours", id)));
        }
        Ok(assignment)
    }

    async fn step_assignment(
        &self,
        assignment: &WorkerAssignment,
        to: AssignmentState,
        patch: AssignmentPatch,
        booking: Option<BookingTransition>,
    ) -> CoreResult<(WorkerAssignment, Option<Booking>)> {
        if !assignment.state.can_transition_to(to) {
            return Err(CoreError::conflict(format!(
                "assignment {} cannot move from {} to {}",
                assignment.id, assignment.state, to
            )));
        }
        let booking_meta = booking
            .as_ref()
            .map(|t| (t.from, t.actor_id, t.detail.clone()));
        let t = AssignmentTransition {
            assignment_id: assignment.id,
            from: assignment.state,
            to,
            patch,
            booking,
        };
        match self.store.transition_assignment(t, self.env.now()).await? {
            AssignmentOutcome::Applied {
                assignment: updated,
                booking,
            } => {
                tracing::info!(
                    target: "AUDIT",
                    assignment_id = updated.id,
                    booking_id = updated.booking_id,
                    worker_id = updated.worker_id,
                    from = %assignment.state,
                    to = %updated.state,
                    "Assignment transition"
                );
                if let (Some(b), Some((from, actor_id, detail))) = (&booking, booking_meta) {
                    self.published(b, from, actor_id, &detail);
                }
                Ok((updated, booking))
            }
            AssignmentOutcome::Stale(current) => Err(CoreError::conflict(format!(
                "assignment {} is {}, expected {}",
                current.id, current.state, assignment.state
            ))),
        }
    }

    pub async fn accept_assignment(&self, worker_id: UserId, assignment_id: AssignmentId) -> CoreResult<WorkerAssignment> {
        let assignment = self.worker_assignment(worker_id, assignment_id).await?;
        let bt = BookingTransition::new(assignment.booking_id, BookingState::Confirmed, BookingState::Assigned)
            .by(worker_id)
            .detail(format!("worker {} accepted", worker_id));
        let (accepted, booking) = self
            .step_assignment(&assignment, AssignmentState::Accepted, AssignmentPatch::default(), Some(bt))
            .await?;
        if let Some(b) = booking {
            self.notify(
                b.customer_id,
                NotificationKind::AssignmentAccepted,
                "Worker assigned",
                format!("A worker accepted {}", b.reference),
                &b,
            )
            .await;
        }
        Ok(accepted)
    }

    pub async fn reject_assignment(
        &self,
        worker_id: UserId,
        assignment_id: AssignmentId,
        reason: &str,
    ) -> CoreResult<WorkerAssignment> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CoreError::validation("a reason is required to reject an assignment"));
        }
        let assignment = self.worker_assignment(worker_id, assignment_id).await?;
        // an accepted assignment already moved the booking forward
        let bt = (assignment.state == AssignmentState::Accepted).then(|| {
            BookingTransition::new(assignment.booking_id, BookingState::Assigned, BookingState::Confirmed)
                .by(worker_id)
                .detail(format!("worker {} withdrew: {}", worker_id, reason))
        });
        let patch = AssignmentPatch {
            rejection_reason: Some(reason.to_string()),
            ..AssignmentPatch::default()
        };
        let (rejected, _) = self
            .step_assignment(&assignment, AssignmentState::Rejected, patch, bt)
            .await?;
        let booking = self.load(rejected.booking_id).await?;
        self.notify_admins(
            NotificationKind::AssignmentRejected,
            "Assignment rejected",
            format!("Worker {} rejected {}: {}", worker_id, booking.reference, reason),
            &booking,
        )
        .await;
        Ok(rejected)
    }

    pub async fn start_work(
        &self,
        worker_id: UserId,
        assignment_id: AssignmentId,
        notes: &str,
    ) -> CoreResult<WorkerAssignment> {
        let notes = notes.trim();
        if notes.is_empty() {
            return Err(CoreError::validation("start notes are required"));
        }
        let assignment = self.worker_assignment(worker_id, assignment_id).await?;
        let bt = BookingTransition::new(assignment.booking_id, BookingState::Assigned, BookingState::InProgress)
            .by(worker_id)
            .detail("work started");
        let patch = AssignmentPatch {
            start_notes: Some(notes.to_string()),
            ..AssignmentPatch::default()
        };
        let (mut started, booking) = self
            .step_assignment(&assignment, AssignmentState::InProgress, patch, Some(bt))
            .await?;
        let session = self.store.open_tracking(&started, self.env.now()).await?;
        started.tracking_session_id = Some(session.id);
        tracing::info!(
            assignment_id,
            tracking_session_id = session.id,
            "Tracking session opened"
        );
        if let Some(b) = booking {
            self.notify(
                b.customer_id,
                NotificationKind::WorkStarted,
                "Work started",
                format!("Work on {} has started", b.reference),
                &b,
            )
            .await;
        }
        Ok(started)
    }

    pub async fn complete_work(
        &self,
        worker_id: UserId,
        assignment_id: AssignmentId,
        report: CompletionReport,
    ) -> CoreResult<WorkerAssignment> {
        if report.notes.trim().is_empty() {
            return Err(CoreError::validation("completion notes are required"));
        }
        let assignment = self.worker_assignment(worker_id, assignment_id).await?;
        let bt = BookingTransition::new(assignment.booking_id, BookingState::InProgress, BookingState::Completed)
            .by(worker_id)
            .detail("work completed");
        let patch = AssignmentPatch {
            completion: Some(report),
            ..AssignmentPatch::default()
        };
        let (completed, booking) = self
            .step_assignment(&assignment, AssignmentState::Completed, patch, Some(bt))
            .await?;
        self.store.close_tracking(assignment_id, self.env.now()).await?;
        if let Some(b) = booking {
            self.notify(
                b.customer_id,
                NotificationKind::WorkCompleted,
                "Work completed",
                format!("{} is complete", b.reference),
                &b,
            )
            .await;
        }
        Ok(completed)
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel on behalf of the customer or an admin.
    ///
    /// The booking is claimed first: it moves to `cancelled` carrying the
    /// refund the policy grants. Only then is a pending payment cancelled
    /// or a completed one refunded, and the refund's ledger entry linked.
    /// Cancelling again finishes a refund that failed part way.
    pub async fn cancel(&self, actor_id: UserId, booking_id: BookingId, reason: &str) -> CoreResult<Booking> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CoreError::validation("a cancellation reason is required"));
        }
        let actor = self.accounts.actor(actor_id).await?;
        let booking = self.load(booking_id).await?;
        let role = if actor.is_admin() {
            CancelRole::Admin
        } else if booking.customer_id == actor_id {
            CancelRole::Customer
        } else {
            return Err(CoreError::forbidden(format!("booking {} is not yours", booking_id)));
        };
        if booking.state == BookingState::Cancelled {
            return self.refund_cancelled(&booking, reason).await;
        }
        if !policy::may_cancel(role, booking.state) {
            return Err(CoreError::conflict(format!(
                "booking {} is {} and can no longer be cancelled",
                booking.reference, booking.state
            )));
        }

        let payment = match booking.payment_id {
            Some(id) => Some(self.payments.get(id).await?),
            None => None,
        };
        let refund_amount = match &payment {
            Some(p) if p.status == PaymentStatus::Completed => {
                let settings = self.env.settings.booking().await;
                Some(policy::refund_due(role, &booking, p.amount, &settings, self.env.now()))
            }
            _ => None,
        };
        let t = BookingTransition::new(booking.id, booking.state, BookingState::Cancelled)
            .by(actor_id)
            .hold_until(None)
            .detail(reason)
            .cancellation(Cancellation {
                actor_id,
                reason: reason.to_string(),
                refund_ledger_id: None,
                refund_amount,
                cancelled_at: self.env.now(),
            });
        let cancelled = self.commit(&booking, t).await?;

        let settled = self.settle_on_cancel(&cancelled, payment.as_ref(), actor_id, reason).await;
        let worker = self.release_assignment(&cancelled).await;
        let body = format!("{} was cancelled: {}", cancelled.reference, reason);
        match role {
            CancelRole::Customer => {
                self.notify_admins(NotificationKind::BookingCancelled, "Booking cancelled", body.clone(), &cancelled)
                    .await;
            }
            CancelRole::Admin => {
                self.notify(cancelled.customer_id, NotificationKind::BookingCancelled, "Booking cancelled", body.clone(), &cancelled)
                    .await;
            }
        }
        if let Some(worker_id) = worker {
            self.notify(worker_id, NotificationKind::BookingCancelled, "Booking cancelled", body, &cancelled)
                .await;
        }
        settled.inspect_err(|e| {
            tracing::error!(
                target: "AUDIT",
                booking_id,
                error = %e,
                "Booking cancelled but its payment is not settled"
            );
        })
    }

    async fn settle_on_cancel(
        &self,
        booking: &Booking,
        payment: Option<&Payment>,
        actor_id: UserId,
        reason: &str,
    ) -> CoreResult<Booking> {
        let Some(payment) = payment else {
            return Ok(booking.clone());
        };
        match payment.status {
            PaymentStatus::Pending => match self.payments.cancel(payment.id, actor_id).await {
                Ok(_) => Ok(booking.clone()),
                // captured meanwhile; the completion hook refunds it
                Err(CoreError::ConflictingTransition(msg)) => {
                    tracing::warn!(booking_id = booking.id, payment_id = payment.id, reason = %msg, "Payment moved during cancel");
                    Ok(booking.clone())
                }
                Err(e) => Err(e),
            },
            PaymentStatus::Completed => self.refund_cancelled(booking, reason).await,
            _ => Ok(booking.clone()),
        }
    }

    /// Issues the refund recorded on a cancelled booking and links its
    /// ledger entry. No-op once linked.
    async fn refund_cancelled(&self, booking: &Booking, reason: &str) -> CoreResult<Booking> {
        let (Some(payment_id), Some(c)) = (booking.payment_id, booking.cancellation.clone()) else {
            return Ok(booking.clone());
        };
        let Some(due) = c.refund_amount else {
            return Ok(booking.clone());
        };
        if due.is_zero() || c.refund_ledger_id.is_some() {
            return Ok(booking.clone());
        }
        let notes = format!("{} cancelled: {}", booking.reference, reason);
        let r = match self.payments.refund(payment_id, Some(due), &notes).await {
            Ok(r) => r,
            Err(CoreError::AlreadyTerminal(msg)) => {
                tracing::warn!(booking_id = booking.id, payment_id, reason = %msg, "Cancelled booking already refunded");
                return Ok(booking.clone());
            }
            Err(e) => return Err(e),
        };
        let t = BookingTransition::new(booking.id, BookingState::Cancelled, BookingState::Cancelled)
            .detail(format!("refund {} issued", r.refund.reference))
            .cancellation(Cancellation {
                refund_ledger_id: Some(r.ledger_entry_id),
                ..c
            });
        let linked = self.apply(t).await?;
        self.notify(
            linked.customer_id,
            NotificationKind::PaymentRefunded,
            "Refund issued",
            format!("{} was returned to your wallet for {}", due, linked.reference),
            &linked,
        )
        .await;
        Ok(linked)
    }

    /// Withdraws the active assignment of a cancelled booking. Returns the
    /// worker to tell.
    async fn release_assignment(&self, booking: &Booking) -> Option<UserId> {
        let assignment = match self.store.active_assignment(booking.id).await {
            Ok(Some(a)) => a,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(booking_id = booking.id, error = %e, "Failed to load assignment");
                return None;
            }
        };
        if matches!(assignment.state, AssignmentState::Pending | AssignmentState::Accepted) {
            let patch = AssignmentPatch {
                rejection_reason: Some("booking cancelled".into()),
                ..AssignmentPatch::default()
            };
            if let Err(e) = self
                .step_assignment(&assignment, AssignmentState::Rejected, patch, None)
                .await
            {
                tracing::error!(assignment_id = assignment.id, error = %e, "Failed to withdraw assignment");
            }
        }
        if let Err(e) = self.store.close_tracking(assignment.id, self.env.now()).await {
            tracing::error!(assignment_id = assignment.id, error = %e, "Failed to close tracking");
        }
        Some(assignment.worker_id)
    }
}

/// Moves bookings when the payments they wait on complete or are
/// cancelled.
struct BookingPaymentListener {
    bookings: Weak<BookingService>,
}

#[async_trait]
impl PaymentListener for BookingPaymentListener {
    async fn on_completed(&self, payment: &Payment) -> CoreResult<()> {
        let Some(booking_id) = payment.relation.and_then(|r| r.booking_id()) else {
            return Ok(());
        };
        let Some(bookings) = self.bookings.upgrade() else {
            return Ok(());
        };
        bookings.on_payment_completed(booking_id, payment).await
    }

    async fn on_cancelled(&self, payment: &Payment) -> CoreResult<()> {
        let Some(booking_id) = payment.relation.and_then(|r| r.booking_id()) else {
            return Ok(());
        };
        let Some(bookings) = self.bookings.upgrade() else {
            return Ok(());
        };
        bookings.on_payment_cancelled(booking_id, payment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment_gateway::mock::MockGateway;
    use crate::test_support::TestWorld;
    use rust_decimal_macros::dec;

    struct Fixture {
        w: TestWorld,
        customer: UserId,
        address: i64,
        service: ServiceId,
    }

    fn fixture() -> Fixture {
        let w = TestWorld::new();
        let customer = w.customer();
        let address = w.address(customer);
        let service = w.fixed_service(dec!(500), 60);
        Fixture {
            w,
            customer,
            address,
            service,
        }
    }

    fn request(f: &Fixture, method: PaymentMethod) -> CreateBooking {
        CreateBooking {
            customer_id: f.customer,
            service_id: f.service,
            slot_start: Some(f.w.now() + Duration::hours(1)),
            address_id: f.address,
            method,
            notes: Some("  gate code 42 ".into()),
        }
    }

    async fn pay(w: &TestWorld, created: &BookingWithPayment, gpid: &str) -> CoreResult<Booking> {
        let order = created.order.gateway_order.as_ref().unwrap();
        let sig = w.gateway.capture(&order.order_id, gpid, order.amount_minor);
        w.bookings
            .verify_payment(created.booking.customer_id, created.booking.id, gpid, &sig)
            .await
    }

    #[tokio::test]
    async fn test_gateway_booking_confirms_on_verify() {
        let f = fixture();
        let created = f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();
        assert_eq!(created.booking.state, BookingState::Held);
        assert_eq!(created.booking.payment_id, Some(created.order.payment.id));
        assert_eq!(created.booking.notes.as_deref(), Some("gate code 42"));
        assert!(created.booking.hold_expires_at.is_some());

        let confirmed = pay(&f.w, &created, "pay_ok").await.unwrap();
        assert_eq!(confirmed.state, BookingState::Confirmed);
        assert_eq!(confirmed.hold_expires_at, None);
        // replay
        assert_eq!(pay(&f.w, &created, "pay_ok").await.unwrap().state, BookingState::Confirmed);

        let states: Vec<_> = f
            .w
            .bookings
            .events(f.customer, confirmed.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.to_state)
            .collect();
        assert_eq!(states.first(), Some(&BookingState::Held));
        assert_eq!(states.last(), Some(&BookingState::Confirmed));
    }

    #[tokio::test]
    async fn test_held_slot_blocks_second_customer() {
        let f = fixture();
        f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();

        let other = f.w.customer();
        let other_address = f.w.address(other);
        let mut req = request(&f, PaymentMethod::Gateway);
        req.customer_id = other;
        req.address_id = other_address;
        let err = f.w.bookings.create(req.clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::ConflictingTransition(_)));

        // hold lapses, slot frees up before any sweep
        f.w.clock.advance(Duration::minutes(8));
        let retaken = f.w.bookings.create(req).await.unwrap();
        assert_eq!(retaken.booking.state, BookingState::Held);
    }

    #[tokio::test]
    async fn test_late_capture_is_refunded() {
        let f = fixture();
        let created = f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();
        f.w.clock.advance(Duration::minutes(8));
        assert_eq!(f.w.bookings.expire_holds().await.unwrap(), 1);

        let err = pay(&f.w, &created, "pay_late").await.unwrap_err();
        assert!(matches!(err, CoreError::ConflictingTransition(_)));
        let booking = f.w.bookings.get_for(f.customer, created.booking.id).await.unwrap();
        assert_eq!(booking.state, BookingState::Expired);
        let payment = f.w.payments.get(created.order.payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(500));

        // replay does not refund twice
        assert!(pay(&f.w, &created, "pay_late").await.is_err());
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(500));
    }

    #[tokio::test]
    async fn test_late_capture_before_sweep() {
        let f = fixture();
        let created = f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();
        f.w.clock.advance(Duration::minutes(8));

        assert!(pay(&f.w, &created, "pay_late").await.is_err());
        assert_eq!(
            f.w.bookings.get_for(f.customer, created.booking.id).await.unwrap().state,
            BookingState::Expired
        );
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(500));
        assert_eq!(f.w.bookings.expire_holds().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wallet_booking_confirms_inline() {
        let f = fixture();
        f.w.fund(f.customer, dec!(600)).await;
        let created = f.w.bookings.create(request(&f, PaymentMethod::Wallet)).await.unwrap();
        assert_eq!(created.booking.state, BookingState::Confirmed);
        assert_eq!(created.booking.payment_id, Some(created.order.payment.id));
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_wallet_shortfall_releases_slot() {
        let f = fixture();
        f.w.fund(f.customer, dec!(100)).await;
        let err = f.w.bookings.create(request(&f, PaymentMethod::Wallet)).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds));

        let date = availability::business_date(&Default::default(), f.w.now()).unwrap();
        let slots = f.w.bookings.available_slots(f.service, date).await.unwrap();
        assert!(slots.iter().any(|s| s.start == f.w.now() + Duration::hours(1)));
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_create_validates_inputs() {
        let f = fixture();
        let mut req = request(&f, PaymentMethod::Gateway);
        req.slot_start = None;
        assert!(matches!(f.w.bookings.create(req).await, Err(CoreError::Validation(_))));

        let mut req = request(&f, PaymentMethod::Gateway);
        req.address_id = f.w.address(f.w.customer());
        assert!(matches!(f.w.bookings.create(req).await, Err(CoreError::Validation(_))));

        let mut req = request(&f, PaymentMethod::Gateway);
        req.slot_start = Some(f.w.now() + Duration::minutes(50));
        assert!(matches!(
            f.w.bookings.create(req).await,
            Err(CoreError::ConflictingTransition(_))
        ));

        let mut req = request(&f, PaymentMethod::Gateway);
        req.customer_id = f.w.worker();
        assert!(matches!(f.w.bookings.create(req).await, Err(CoreError::Forbidden(_))));
    }

    async fn quoted_inquiry(w: &TestWorld, customer: UserId, admin: UserId) -> Booking {
        let service = w.inquiry_service();
        let address = w.address(customer);
        w.fund(customer, dec!(100)).await;
        let created = w
            .bookings
            .create(CreateBooking {
                customer_id: customer,
                service_id: service,
                slot_start: None,
                address_id: address,
                method: PaymentMethod::Wallet,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(created.booking.state, BookingState::InquiryPaid);
        assert_eq!(w.notifications.unread_count(admin).await.unwrap(), 1);

        w.bookings.mark_awaiting_quote(admin, created.booking.id).await.unwrap();
        w.bookings
            .provide_quote(ProvideQuote {
                admin_id: admin,
                booking_id: created.booking.id,
                amount: dec!(2500),
                notes: Some("two rooms".into()),
                ttl_hours: None,
                duration_minutes: Some(120),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_inquiry_quote_accept_schedule_confirm() {
        let w = TestWorld::new();
        let admin = w.admin();
        let customer = w.customer();
        let quoted = quoted_inquiry(&w, customer, admin).await;
        assert_eq!(quoted.state, BookingState::Quoted);

        let accepted = w.bookings.accept_quote(customer, quoted.id).await.unwrap();
        assert_eq!(accepted.state, BookingState::QuoteAccepted);
        assert_eq!(accepted.quote.as_ref().unwrap().decision, Some(QuoteDecision::Accepted));

        // 11:15 local sits on the 120 + 15 minute grid
        let scheduled = w
            .bookings
            .schedule_after_quote(customer, quoted.id, w.now() + Duration::hours(2), PaymentMethod::Gateway)
            .await
            .unwrap();
        assert_eq!(scheduled.booking.state, BookingState::Held);
        assert_eq!(scheduled.order.payment.kind, PaymentKind::Quote);
        assert_eq!(scheduled.order.payment.amount, dec!(2500));
        assert_eq!(
            scheduled.booking.scheduled_end.unwrap() - scheduled.booking.scheduled_start.unwrap(),
            Duration::minutes(120)
        );

        let confirmed = pay(&w, &scheduled, "pay_quote").await.unwrap();
        assert_eq!(confirmed.state, BookingState::Confirmed);
    }

    #[tokio::test]
    async fn test_quote_expiry() {
        let w = TestWorld::new();
        let admin = w.admin();
        let customer = w.customer();
        let quoted = quoted_inquiry(&w, customer, admin).await;

        w.clock.advance(Duration::hours(49));
        let err = w.bookings.accept_quote(customer, quoted.id).await.unwrap_err();
        assert!(matches!(err, CoreError::ConflictingTransition(_)));
        assert_eq!(w.bookings.expire_quotes().await.unwrap(), 1);
        assert_eq!(
            w.bookings.get_for(customer, quoted.id).await.unwrap().state,
            BookingState::QuoteExpired
        );
        assert_eq!(w.bookings.expire_quotes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quote_revision_and_rejection() {
        let w = TestWorld::new();
        let admin = w.admin();
        let customer = w.customer();
        let quoted = quoted_inquiry(&w, customer, admin).await;

        let revised = w
            .bookings
            .update_quote(ProvideQuote {
                admin_id: admin,
                booking_id: quoted.id,
                amount: dec!(2200),
                notes: None,
                ttl_hours: Some(24),
                duration_minutes: None,
            })
            .await
            .unwrap();
        assert_eq!(revised.quote.as_ref().unwrap().amount, dec!(2200));
        assert_eq!(revised.quote.as_ref().unwrap().duration_minutes, DEFAULT_QUOTE_DURATION_MINUTES);

        let other = w.customer();
        assert!(matches!(
            w.bookings.reject_quote(other, quoted.id, "no").await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            w.bookings.reject_quote(customer, quoted.id, " ").await,
            Err(CoreError::Validation(_))
        ));
        let rejected = w.bookings.reject_quote(customer, quoted.id, "too expensive").await.unwrap();
        assert_eq!(rejected.state, BookingState::QuoteRejected);
        assert!(w.bookings.accept_quote(customer, quoted.id).await.is_err());
    }

    async fn confirmed(f: &Fixture) -> Booking {
        f.w.fund(f.customer, dec!(500)).await;
        f.w.bookings
            .create(request(f, PaymentMethod::Wallet))
            .await
            .unwrap()
            .booking
    }

    #[tokio::test]
    async fn test_assignment_lifecycle() {
        let f = fixture();
        let admin = f.w.admin();
        let worker = f.w.worker();
        let booking = confirmed(&f).await;

        let a = f.w.bookings.assign_worker(admin, booking.id, worker).await.unwrap();
        assert_eq!(a.state, AssignmentState::Pending);
        assert!(f.w.bookings.assign_worker(admin, booking.id, f.w.worker()).await.is_err());
        assert!(matches!(
            f.w.bookings.accept_assignment(f.w.worker(), a.id).await,
            Err(CoreError::Forbidden(_))
        ));

        f.w.bookings.accept_assignment(worker, a.id).await.unwrap();
        assert_eq!(f.w.bookings.get_for(worker, booking.id).await.unwrap().state, BookingState::Assigned);
        assert!(f.w.bookings.start_work(worker, a.id, "").await.is_err());

        let started = f.w.bookings.start_work(worker, a.id, "on site").await.unwrap();
        assert!(started.tracking_session_id.is_some());
        assert_eq!(f.w.bookings.get_for(f.customer, booking.id).await.unwrap().state, BookingState::InProgress);
        assert!(matches!(
            f.w.bookings.cancel(f.customer, booking.id, "changed mind").await,
            Err(CoreError::ConflictingTransition(_))
        ));

        let report = CompletionReport {
            notes: "replaced tap".into(),
            materials_used: vec!["tap".into()],
            photos: vec![],
        };
        let done = f.w.bookings.complete_work(worker, a.id, report).await.unwrap();
        assert_eq!(done.state, AssignmentState::Completed);
        assert_eq!(f.w.bookings.get_for(f.customer, booking.id).await.unwrap().state, BookingState::Completed);
        assert_eq!(f.w.bookings.assignments_for_worker(worker, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_withdrawn_assignment_returns_booking_to_confirmed() {
        let f = fixture();
        let admin = f.w.admin();
        let worker = f.w.worker();
        let booking = confirmed(&f).await;

        let a = f.w.bookings.assign_worker(admin, booking.id, worker).await.unwrap();
        f.w.bookings.accept_assignment(worker, a.id).await.unwrap();
        let rejected = f.w.bookings.reject_assignment(worker, a.id, "sick").await.unwrap();
        assert_eq!(rejected.state, AssignmentState::Rejected);
        assert_eq!(f.w.bookings.get_for(admin, booking.id).await.unwrap().state, BookingState::Confirmed);

        let replacement = f.w.worker();
        assert!(f.w.bookings.assign_worker(admin, booking.id, replacement).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_refunds_per_policy() {
        let f = fixture();
        let booking = confirmed(&f).await;
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(0));

        // slot starts in an hour, inside the two hour cutoff
        let cancelled = f.w.bookings.cancel(f.customer, booking.id, "plans changed").await.unwrap();
        assert_eq!(cancelled.state, BookingState::Cancelled);
        let c = cancelled.cancellation.unwrap();
        assert_eq!(c.refund_amount, Some(dec!(250)));
        assert!(c.refund_ledger_id.is_some());
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(250));

        // idempotent
        let again = f.w.bookings.cancel(f.customer, booking.id, "again").await.unwrap();
        assert_eq!(again.state, BookingState::Cancelled);
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(250));
    }

    #[tokio::test]
    async fn test_admin_cancel_refunds_in_full_and_frees_worker() {
        let f = fixture();
        let admin = f.w.admin();
        let worker = f.w.worker();
        let booking = confirmed(&f).await;
        let a = f.w.bookings.assign_worker(admin, booking.id, worker).await.unwrap();

        f.w.bookings.cancel(admin, booking.id, "no capacity").await.unwrap();
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(500));
        assert!(matches!(
            f.w.bookings.accept_assignment(worker, a.id).await,
            Err(CoreError::ConflictingTransition(_))
        ));
        assert!(f.w.notifications.unread_count(worker).await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_cancel_held_cancels_pending_payment() {
        let f = fixture();
        let created = f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();
        let stranger = f.w.customer();
        assert!(matches!(
            f.w.bookings.cancel(stranger, created.booking.id, "x").await,
            Err(CoreError::Forbidden(_))
        ));

        f.w.bookings.cancel(f.customer, created.booking.id, "found someone else").await.unwrap();
        let payment = f.w.payments.get(created.order.payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Cancelled);
        // capture of a cancelled payment is refused
        let order = created.order.gateway_order.as_ref().unwrap();
        let sig = MockGateway::sign_checkout(&order.order_id, "pay_x");
        assert!(f.w.payments.verify_and_complete(payment.id, "pay_x", &sig).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_moves_no_money_when_booking_changed_first() {
        let f = fixture();
        let booking = confirmed(&f).await;
        f.w.store.cut_in_before(
            BookingState::Cancelled,
            BookingTransition::new(booking.id, BookingState::Confirmed, BookingState::Assigned)
                .detail("assigned concurrently"),
        );

        let err = f.w.bookings.cancel(f.customer, booking.id, "plans changed").await.unwrap_err();
        assert!(matches!(err, CoreError::ConflictingTransition(_)));
        let current = f.w.bookings.get_for(f.customer, booking.id).await.unwrap();
        assert_eq!(current.state, BookingState::Assigned);
        assert_eq!(current.cancellation, None);
        let payment = f.w.payments.get(booking.payment_id.unwrap()).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_cancel_again_issues_refund_left_behind() {
        let f = fixture();
        let booking = confirmed(&f).await;
        // claimed with a refund due, but the refund never ran
        let t = BookingTransition::new(booking.id, BookingState::Confirmed, BookingState::Cancelled)
            .by(f.customer)
            .cancellation(Cancellation {
                actor_id: f.customer,
                reason: "plans changed".into(),
                refund_ledger_id: None,
                refund_amount: Some(dec!(250)),
                cancelled_at: f.w.now(),
            });
        BookingStore::transition(&*f.w.store, t, f.w.now()).await.unwrap();
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(0));

        let retried = f.w.bookings.cancel(f.customer, booking.id, "plans changed").await.unwrap();
        assert!(retried.cancellation.unwrap().refund_ledger_id.is_some());
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(250));
        f.w.bookings.cancel(f.customer, booking.id, "plans changed").await.unwrap();
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(250));
    }

    #[tokio::test]
    async fn test_capture_after_cancel_is_refunded_in_full() {
        let f = fixture();
        let created = f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();
        // cancel has claimed the booking but not yet reached the payment
        let t = BookingTransition::new(created.booking.id, BookingState::Held, BookingState::Cancelled)
            .by(f.customer)
            .hold_until(None)
            .cancellation(Cancellation {
                actor_id: f.customer,
                reason: "plans changed".into(),
                refund_ledger_id: None,
                refund_amount: None,
                cancelled_at: f.w.now(),
            });
        BookingStore::transition(&*f.w.store, t, f.w.now()).await.unwrap();

        let booking = pay(&f.w, &created, "pay_after_cancel").await.unwrap();
        assert_eq!(booking.state, BookingState::Cancelled);
        let payment = f.w.payments.get(created.order.payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(500));
    }

    #[tokio::test]
    async fn test_kept_inquiry_fee_is_not_refunded_on_replay() {
        let w = TestWorld::new();
        let customer = w.customer();
        let address = w.address(customer);
        let service = w.inquiry_service();
        w.fund(customer, dec!(100)).await;
        let created = w
            .bookings
            .create(CreateBooking {
                customer_id: customer,
                service_id: service,
                slot_start: None,
                address_id: address,
                method: PaymentMethod::Wallet,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(created.booking.state, BookingState::InquiryPaid);

        let cancelled = w.bookings.cancel(customer, created.booking.id, "not needed").await.unwrap();
        assert_eq!(cancelled.cancellation.unwrap().refund_amount, Some(dec!(0)));
        let fee = w.payments.get(created.order.payment.id).await.unwrap();
        w.bookings.on_payment_completed(created.booking.id, &fee).await.unwrap();
        assert_eq!(w.ledger.balance(customer).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_sweep_confirms_hold_whose_capture_did_not_land() {
        let f = fixture();
        let created = f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();
        f.w.store.fail_next_transition_to(BookingState::Confirmed);
        assert!(pay(&f.w, &created, "pay_stuck").await.is_err());
        let payment = f.w.payments.get(created.order.payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        let booking = f.w.bookings.get_for(f.customer, created.booking.id).await.unwrap();
        assert_eq!(booking.state, BookingState::Held);

        // captured inside the hold, so the sweep confirms instead of expiring
        f.w.clock.advance(Duration::minutes(8));
        assert_eq!(f.w.bookings.expire_holds().await.unwrap(), 0);
        let booking = f.w.bookings.get_for(f.customer, created.booking.id).await.unwrap();
        assert_eq!(booking.state, BookingState::Confirmed);
        assert_eq!(booking.hold_expires_at, None);
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_sweep_refunds_late_capture_that_did_not_land() {
        let f = fixture();
        let created = f.w.bookings.create(request(&f, PaymentMethod::Gateway)).await.unwrap();
        f.w.clock.advance(Duration::minutes(8));
        f.w.store.fail_next_transition_to(BookingState::Expired);
        assert!(pay(&f.w, &created, "pay_late").await.is_err());
        assert_eq!(
            f.w.bookings.get_for(f.customer, created.booking.id).await.unwrap().state,
            BookingState::Held
        );

        assert_eq!(f.w.bookings.expire_holds().await.unwrap(), 1);
        assert_eq!(
            f.w.bookings.get_for(f.customer, created.booking.id).await.unwrap().state,
            BookingState::Expired
        );
        let payment = f.w.payments.get(created.order.payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(f.w.ledger.balance(f.customer).await.unwrap(), dec!(500));
    }

    #[tokio::test]
    async fn test_live_update_reaches_customer() {
        let f = fixture();
        let mut ch = f
            .w
            .hub
            .register(f.customer, crate::presence::Scope::UserNotifications(f.customer));
        f.w.fund(f.customer, dec!(500)).await;
        f.w.bookings.create(request(&f, PaymentMethod::Wallet)).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = ch.rx.try_recv() {
            if let ChannelEvent::BookingUpdate { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec!["confirmed".to_string()]);
    }
}
