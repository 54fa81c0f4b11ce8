//! In-memory store for tests
//!
//! Implements every store trait over one mutex-guarded state. Multi-row
//! operations run against a copy of the state and swap it in only when
//! they succeed, so a failed call leaves nothing behind (the same contract
//! the Postgres transactions give).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::account::{
    AccountStore, Actor, ActorKind, AddressSnapshot, PricingMode, Service, SubscriptionPlan,
    UserSubscription,
};
use crate::availability::Occupancy;
use crate::booking::{
    AssignmentOutcome, AssignmentState, AssignmentTransition, Booking, BookingEvent,
    BookingOutcome, BookingState, BookingStore, BookingTransition, NewBooking, TrackingSession,
    WorkerAssignment,
};
use crate::conversations::{
    Conversation, ConversationStore, HistoryQuery, Message, NewConversation,
};
use crate::core_types::{
    AddressId, AssignmentId, BookingId, CURRENCY_INR, ConversationId, MessageId, NotificationId,
    PaymentId, PlanId, ServiceId, UserId,
};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{LedgerDraft, LedgerEntry, LedgerStore, next_link};
use crate::notifications::{
    DeviceToken, ListQuery, NewNotification, Notification, NotificationStore,
};
use crate::payments::{
    AppliedTransition, NewPayment, Payment, PaymentKind, PaymentMethod, PaymentStatus, PaymentStore,
    PaymentTransition, TransitionOutcome,
};
use crate::settings::SettingsStore;

#[derive(Clone, Default)]
struct Inner {
    seq: i64,
    actors: BTreeMap<UserId, Actor>,
    services: HashMap<ServiceId, Service>,
    plans: HashMap<PlanId, SubscriptionPlan>,
    subscriptions: Vec<UserSubscription>,
    addresses: HashMap<AddressId, (UserId, AddressSnapshot)>,
    ledger: Vec<LedgerEntry>,
    payments: BTreeMap<PaymentId, Payment>,
    webhook_events: HashSet<(String, String)>,
    bookings: BTreeMap<BookingId, Booking>,
    booking_events: Vec<BookingEvent>,
    assignments: BTreeMap<AssignmentId, WorkerAssignment>,
    tracking: Vec<TrackingSession>,
    notifications: BTreeMap<NotificationId, Notification>,
    devices: Vec<DeviceToken>,
    conversations: BTreeMap<ConversationId, Conversation>,
    read_markers: HashMap<(ConversationId, UserId), MessageId>,
    messages: Vec<Message>,
    settings: Vec<(String, String)>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn append_entry(&mut self, draft: &LedgerDraft, now: DateTime<Utc>) -> CoreResult<LedgerEntry> {
        let cached = self
            .actors
            .get(&draft.user_id)
            .map(|a| a.wallet_balance)
            .ok_or_else(|| CoreError::not_found(format!("wallet of user {}", draft.user_id)))?;
        let head = self
            .ledger
            .iter()
            .rev()
            .find(|e| e.user_id == draft.user_id)
            .map(|e| e.new_balance)
            .unwrap_or(Decimal::ZERO);
        let link = next_link(head, cached, draft)?;

        let entry = LedgerEntry {
            id: self.next_id(),
            user_id: draft.user_id,
            amount: draft.amount,
            cause_payment_id: draft.cause_payment_id,
            prev_balance: link.prev_balance,
            new_balance: link.new_balance,
            kind: draft.kind,
            created_at: now,
        };
        self.ledger.push(entry.clone());
        if let Some(actor) = self.actors.get_mut(&draft.user_id) {
            actor.wallet_balance = link.new_balance;
        }
        Ok(entry)
    }

    fn insert_payment(&mut self, p: &NewPayment, now: DateTime<Utc>) -> Payment {
        let payment = Payment {
            id: self.next_id(),
            reference: p.reference.clone(),
            user_id: p.user_id,
            amount: p.amount,
            currency: CURRENCY_INR.to_string(),
            kind: p.kind,
            method: p.method,
            status: p.status,
            gateway_order_id: None,
            gateway_payment_id: None,
            relation: p.relation,
            notes: p.notes.clone(),
            created_at: now,
            updated_at: now,
        };
        self.payments.insert(payment.id, payment.clone());
        payment
    }

    /// Mirrors the partial unique index over slot-holding states.
    fn check_slot(&self, booking: &Booking) -> CoreResult<()> {
        if !booking.state.holds_slot() {
            return Ok(());
        }
        let (Some(start), Some(end)) = (booking.scheduled_start, booking.scheduled_end) else {
            return Ok(());
        };
        let taken = self.bookings.values().any(|b| {
            b.id != booking.id
                && b.service_id == booking.service_id
                && b.state.holds_slot()
                && b.scheduled_start == Some(start)
                && b.scheduled_end == Some(end)
        });
        if taken {
            return Err(CoreError::conflict(format!(
                "unique constraint: slot {} - {} of service {} is taken",
                start, end, booking.service_id
            )));
        }
        Ok(())
    }

    fn push_event(
        &mut self,
        booking_id: BookingId,
        actor_id: Option<UserId>,
        from: Option<BookingState>,
        to: BookingState,
        detail: &str,
        now: DateTime<Utc>,
    ) {
        let id = self.next_id();
        self.booking_events.push(BookingEvent {
            id,
            booking_id,
            actor_id,
            from_state: from,
            to_state: to,
            detail: detail.to_string(),
            created_at: now,
        });
    }

    /// `Ok(Err(current))` when the state moved.
    fn transition_booking(
        &mut self,
        t: &BookingTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<Result<Booking, Booking>> {
        let mut booking = self
            .bookings
            .get(&t.booking_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("booking {}", t.booking_id)))?;
        if booking.state != t.from {
            return Ok(Err(booking));
        }
        booking.apply(t, now);
        self.check_slot(&booking)?;
        self.bookings.insert(booking.id, booking.clone());
        self.push_event(booking.id, t.actor_id, Some(t.from), t.to, &t.detail, now);
        Ok(Ok(booking))
    }
}

/// Something to do before the next booking transition into a state.
enum Interference {
    Apply(BookingTransition),
    Fail,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    interference: Mutex<Option<(BookingState, Interference)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `f` on a copy of the state; keep the copy only on success.
    fn atomically<T>(&self, f: impl FnOnce(&mut Inner) -> CoreResult<T>) -> CoreResult<T> {
        let mut guard = self.lock();
        let mut work = guard.clone();
        let out = f(&mut work)?;
        *guard = work;
        Ok(out)
    }

    /// Apply `t` right before the next booking transition into `trigger`,
    /// as if another request had committed it first.
    pub fn cut_in_before(&self, trigger: BookingState, t: BookingTransition) {
        *self.interference.lock().unwrap_or_else(|p| p.into_inner()) =
            Some((trigger, Interference::Apply(t)));
    }

    /// Fail the next booking transition into `trigger`.
    pub fn fail_next_transition_to(&self, trigger: BookingState) {
        *self.interference.lock().unwrap_or_else(|p| p.into_inner()) =
            Some((trigger, Interference::Fail));
    }

    fn interfere(&self, to: BookingState, now: DateTime<Utc>) -> CoreResult<()> {
        let due = {
            let mut slot = self.interference.lock().unwrap_or_else(|p| p.into_inner());
            match slot.as_ref() {
                Some((trigger, _)) if *trigger == to => slot.take().map(|(_, i)| i),
                _ => None,
            }
        };
        match due {
            Some(Interference::Apply(t)) => self.atomically(|inner| {
                inner.transition_booking(&t, now).map(|_| ())
            }),
            Some(Interference::Fail) => Err(CoreError::internal(format!(
                "injected failure moving a booking to {}",
                to
            ))),
            None => Ok(()),
        }
    }

    fn add_actor(&self, id: UserId, kind: ActorKind) {
        let mut inner = self.lock();
        inner.seq = inner.seq.max(id);
        inner.actors.insert(
            id,
            Actor {
                id,
                phone: format!("+91900000{:04}", id),
                email: Some(format!("{}{}@example.test", kind, id)),
                kind,
                active: true,
                verified: true,
                wallet_balance: Decimal::ZERO,
                has_active_subscription: false,
            },
        );
    }

    pub fn add_customer(&self, id: UserId) {
        self.add_actor(id, ActorKind::Customer);
    }

    pub fn add_worker(&self, id: UserId) {
        self.add_actor(id, ActorKind::Worker);
    }

    pub fn add_admin(&self, id: UserId) {
        self.add_actor(id, ActorKind::Admin);
    }

    pub fn deactivate(&self, id: UserId) {
        if let Some(actor) = self.lock().actors.get_mut(&id) {
            actor.active = false;
        }
    }

    /// Break the cached balance without touching the chain.
    pub fn corrupt_wallet_balance(&self, id: UserId, balance: Decimal) {
        if let Some(actor) = self.lock().actors.get_mut(&id) {
            actor.wallet_balance = balance;
        }
    }

    pub fn add_service(
        &self,
        pricing_mode: PricingMode,
        price: Option<Decimal>,
        duration_minutes: Option<i64>,
    ) -> ServiceId {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.services.insert(
            id,
            Service {
                id,
                name: format!("service {}", id),
                active: true,
                pricing_mode,
                price,
                duration_minutes,
                category_id: None,
                subcategory_id: None,
            },
        );
        id
    }

    pub fn add_plan(&self, price: Decimal, duration_days: i64) -> PlanId {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.plans.insert(
            id,
            SubscriptionPlan {
                id,
                name: format!("plan {}", id),
                price,
                duration_days,
                active: true,
            },
        );
        id
    }

    pub fn add_address(&self, customer_id: UserId) -> AddressId {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.addresses.insert(
            id,
            (
                customer_id,
                AddressSnapshot {
                    address_id: id,
                    label: "Home".to_string(),
                    line: format!("{} MG Road", id),
                    city: "Siliguri".to_string(),
                    state: "West Bengal".to_string(),
                    postal_code: "734001".to_string(),
                    latitude: Some(26.7271),
                    longitude: Some(88.3953),
                },
            ),
        );
        id
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        let mut inner = self.lock();
        inner.settings.retain(|(k, _)| k != key);
        inner.settings.push((key.to_string(), value.to_string()));
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_actor(&self, user_id: UserId, now: DateTime<Utc>) -> CoreResult<Option<Actor>> {
        let inner = self.lock();
        Ok(inner.actors.get(&user_id).map(|a| Actor {
            has_active_subscription: inner
                .subscriptions
                .iter()
                .any(|s| s.user_id == user_id && s.is_active(now)),
            ..a.clone()
        }))
    }

    async fn admin_ids(&self) -> CoreResult<Vec<UserId>> {
        Ok(self
            .lock()
            .actors
            .values()
            .filter(|a| a.is_admin() && a.active)
            .map(|a| a.id)
            .collect())
    }

    async fn get_service(&self, service_id: ServiceId) -> CoreResult<Option<Service>> {
        Ok(self.lock().services.get(&service_id).cloned())
    }

    async fn get_plan(&self, plan_id: PlanId) -> CoreResult<Option<SubscriptionPlan>> {
        Ok(self.lock().plans.get(&plan_id).cloned())
    }

    async fn get_address(
        &self,
        customer_id: UserId,
        address_id: AddressId,
    ) -> CoreResult<Option<AddressSnapshot>> {
        Ok(self
            .lock()
            .addresses
            .get(&address_id)
            .filter(|(owner, _)| *owner == customer_id)
            .map(|(_, a)| a.clone()))
    }

    async fn activate_subscription(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        payment_id: PaymentId,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<UserSubscription> {
        let mut inner = self.lock();
        if let Some(existing) = inner.subscriptions.iter().find(|s| s.payment_id == payment_id) {
            return Ok(existing.clone());
        }
        let sub = UserSubscription {
            id: inner.next_id(),
            plan_id,
            user_id,
            started_at,
            expires_at,
            payment_id,
        };
        inner.subscriptions.push(sub.clone());
        Ok(sub)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn append(&self, draft: LedgerDraft, now: DateTime<Utc>) -> CoreResult<LedgerEntry> {
        self.atomically(|inner| inner.append_entry(&draft, now))
    }

    async fn latest(&self, user_id: UserId) -> CoreResult<Option<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger
            .iter()
            .rev()
            .find(|e| e.user_id == user_id)
            .cloned())
    }

    async fn entries(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| from.is_none_or(|f| e.created_at >= f))
            .filter(|e| to.is_none_or(|t| e.created_at < t))
            .cloned()
            .collect())
    }

    async fn cached_balance(&self, user_id: UserId) -> CoreResult<Decimal> {
        self.lock()
            .actors
            .get(&user_id)
            .map(|a| a.wallet_balance)
            .ok_or_else(|| CoreError::not_found(format!("user {}", user_id)))
    }

    async fn wallet_users(&self) -> CoreResult<Vec<UserId>> {
        let inner = self.lock();
        Ok(inner
            .actors
            .values()
            .filter(|a| {
                a.wallet_balance != Decimal::ZERO || inner.ledger.iter().any(|e| e.user_id == a.id)
            })
            .map(|a| a.id)
            .collect())
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn insert(
        &self,
        payment: NewPayment,
        entries: Vec<LedgerDraft>,
        now: DateTime<Utc>,
    ) -> CoreResult<(Payment, Vec<LedgerEntry>)> {
        self.atomically(|inner| {
            let inserted = inner.insert_payment(&payment, now);
            let mut written = Vec::with_capacity(entries.len());
            for draft in entries {
                let draft = match draft.cause_payment_id {
                    Some(_) => draft,
                    None => draft.caused_by(inserted.id),
                };
                written.push(inner.append_entry(&draft, now)?);
            }
            Ok((inserted, written))
        })
    }

    async fn get(&self, id: PaymentId) -> CoreResult<Option<Payment>> {
        Ok(self.lock().payments.get(&id).cloned())
    }

    async fn get_by_order_id(&self, order_id: &str) -> CoreResult<Option<Payment>> {
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.gateway_order_id.as_deref() == Some(order_id))
            .cloned())
    }

    async fn set_gateway_order(
        &self,
        id: PaymentId,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if let Some(p) = self.lock().payments.get_mut(&id)
            && p.status == PaymentStatus::Pending
        {
            p.gateway_order_id = Some(order_id.to_string());
            p.updated_at = now;
        }
        Ok(())
    }

    async fn transition(
        &self,
        t: PaymentTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<TransitionOutcome> {
        self.atomically(|inner| {
            let current = inner
                .payments
                .get(&t.payment_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("payment {}", t.payment_id)))?;
            if current.status != t.from {
                return Ok(TransitionOutcome::Stale(current));
            }

            let mut payment = current;
            payment.status = t.to;
            if let Some(gpid) = &t.gateway_payment_id {
                payment.gateway_payment_id = Some(gpid.clone());
            }
            if let Some(notes) = &t.notes {
                payment.notes = Some(notes.clone());
            }
            payment.updated_at = now;
            inner.payments.insert(payment.id, payment.clone());

            let companion = t.companion.as_ref().map(|c| inner.insert_payment(c, now));

            let mut entries = Vec::with_capacity(t.entries.len());
            for draft in &t.entries {
                entries.push(inner.append_entry(draft, now)?);
            }
            Ok(TransitionOutcome::Applied(AppliedTransition {
                payment,
                companion,
                entries,
            }))
        })
    }

    async fn list_for_user(&self, user_id: UserId, limit: i64) -> CoreResult<Vec<Payment>> {
        Ok(self
            .lock()
            .payments
            .values()
            .rev()
            .filter(|p| p.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn webhook_event_seen(
        &self,
        event_kind: &str,
        gateway_payment_id: &str,
    ) -> CoreResult<bool> {
        Ok(self
            .lock()
            .webhook_events
            .contains(&(event_kind.to_string(), gateway_payment_id.to_string())))
    }

    async fn record_webhook_event(
        &self,
        event_kind: &str,
        gateway_payment_id: &str,
        _now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        Ok(self
            .lock()
            .webhook_events
            .insert((event_kind.to_string(), gateway_payment_id.to_string())))
    }

    async fn pending_withdrawals_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<Payment>> {
        let mut due: Vec<Payment> = self
            .lock()
            .payments
            .values()
            .filter(|p| {
                p.kind == PaymentKind::Withdrawal
                    && p.status == PaymentStatus::Pending
                    && p.created_at <= cutoff
            })
            .cloned()
            .collect();
        due.sort_by_key(|p| p.created_at);
        Ok(due)
    }

    async fn pending_gateway_payments_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<Payment>> {
        let mut due: Vec<Payment> = self
            .lock()
            .payments
            .values()
            .filter(|p| {
                p.method == PaymentMethod::Gateway
                    && p.status == PaymentStatus::Pending
                    && p.created_at <= cutoff
            })
            .cloned()
            .collect();
        due.sort_by_key(|p| p.created_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert(&self, b: NewBooking, now: DateTime<Utc>) -> CoreResult<Booking> {
        self.atomically(|inner| {
            let booking = Booking {
                id: inner.next_id(),
                reference: b.reference.clone(),
                customer_id: b.customer_id,
                service_id: b.service_id,
                kind: b.kind,
                state: b.state,
                scheduled_start: b.scheduled_start,
                scheduled_end: b.scheduled_end,
                address: b.address.clone(),
                contact: b.contact.clone(),
                notes: b.notes.clone(),
                hold_expires_at: b.hold_expires_at,
                quote: None,
                payment_id: None,
                cancellation: None,
                created_at: now,
                updated_at: now,
            };
            inner.check_slot(&booking)?;
            inner.bookings.insert(booking.id, booking.clone());
            inner.push_event(booking.id, Some(b.customer_id), None, b.state, "created", now);
            Ok(booking)
        })
    }

    async fn get(&self, id: BookingId) -> CoreResult<Option<Booking>> {
        Ok(self.lock().bookings.get(&id).cloned())
    }

    async fn transition(
        &self,
        t: BookingTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<BookingOutcome> {
        self.interfere(t.to, now)?;
        self.atomically(|inner| {
            Ok(match inner.transition_booking(&t, now)? {
                Ok(booking) => BookingOutcome::Applied(booking),
                Err(current) => BookingOutcome::Stale(current),
            })
        })
    }

    async fn occupancy(
        &self,
        service_id: ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<Occupancy>> {
        let mut rows: Vec<Occupancy> = self
            .lock()
            .bookings
            .values()
            .filter(|b| b.service_id == service_id && b.state.occupies_calendar())
            .filter_map(|b| match (b.scheduled_start, b.scheduled_end) {
                (Some(start), Some(end)) if start < to && end > from => Some(Occupancy {
                    start,
                    end,
                    state: b.state,
                    hold_expires_at: b.hold_expires_at,
                }),
                _ => None,
            })
            .collect();
        rows.sort_by_key(|o| o.start);
        Ok(rows)
    }

    async fn lapsed_holds(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let mut rows: Vec<Booking> = self
            .lock()
            .bookings
            .values()
            .filter(|b| b.hold_lapsed(now))
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.hold_expires_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn lapsed_quotes(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        Ok(self
            .lock()
            .bookings
            .values()
            .filter(|b| {
                b.state == BookingState::Quoted
                    && b.quote
                        .as_ref()
                        .is_some_and(|q| !q.is_decided() && q.is_expired(now))
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_for_customer(&self, customer_id: UserId, limit: i64) -> CoreResult<Vec<Booking>> {
        Ok(self
            .lock()
            .bookings
            .values()
            .rev()
            .filter(|b| b.customer_id == customer_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn events(&self, booking_id: BookingId) -> CoreResult<Vec<BookingEvent>> {
        Ok(self
            .lock()
            .booking_events
            .iter()
            .filter(|e| e.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_assignment(
        &self,
        booking_id: BookingId,
        worker_id: UserId,
        assigned_by: UserId,
        now: DateTime<Utc>,
    ) -> CoreResult<WorkerAssignment> {
        self.atomically(|inner| {
            let state = inner
                .bookings
                .get(&booking_id)
                .map(|b| b.state)
                .ok_or_else(|| CoreError::not_found(format!("booking {}", booking_id)))?;
            if state != BookingState::Confirmed {
                return Err(CoreError::conflict(format!(
                    "booking {} is {}, workers are assigned to confirmed bookings",
                    booking_id, state
                )));
            }
            if inner
                .assignments
                .values()
                .any(|a| a.booking_id == booking_id && a.is_active())
            {
                return Err(CoreError::conflict(format!(
                    "unique constraint: booking {} already has an active assignment",
                    booking_id
                )));
            }
            let assignment = WorkerAssignment {
                id: inner.next_id(),
                booking_id,
                worker_id,
                assigned_by,
                state: AssignmentState::Pending,
                assigned_at: now,
                accepted_at: None,
                rejected_at: None,
                started_at: None,
                completed_at: None,
                rejection_reason: None,
                start_notes: None,
                completion: None,
                tracking_session_id: None,
            };
            inner.assignments.insert(assignment.id, assignment.clone());
            Ok(assignment)
        })
    }

    async fn get_assignment(&self, id: AssignmentId) -> CoreResult<Option<WorkerAssignment>> {
        Ok(self.lock().assignments.get(&id).cloned())
    }

    async fn active_assignment(
        &self,
        booking_id: BookingId,
    ) -> CoreResult<Option<WorkerAssignment>> {
        Ok(self
            .lock()
            .assignments
            .values()
            .find(|a| a.booking_id == booking_id && a.is_active())
            .cloned())
    }

    async fn assignments_for_worker(
        &self,
        worker_id: UserId,
        limit: i64,
    ) -> CoreResult<Vec<WorkerAssignment>> {
        Ok(self
            .lock()
            .assignments
            .values()
            .rev()
            .filter(|a| a.worker_id == worker_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn transition_assignment(
        &self,
        t: AssignmentTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<AssignmentOutcome> {
        self.atomically(|inner| {
            let mut assignment = inner
                .assignments
                .get(&t.assignment_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("assignment {}", t.assignment_id)))?;
            if assignment.state != t.from {
                return Ok(AssignmentOutcome::Stale(assignment));
            }
            assignment.apply(&t, now);
            inner.assignments.insert(assignment.id, assignment.clone());

            let booking = match &t.booking {
                Some(bt) => match inner.transition_booking(bt, now)? {
                    Ok(b) => Some(b),
                    Err(current) => {
                        return Err(CoreError::conflict(format!(
                            "booking {} is {}, expected {}",
                            current.id, current.state, bt.from
                        )));
                    }
                },
                None => None,
            };
            Ok(AssignmentOutcome::Applied {
                assignment,
                booking,
            })
        })
    }

    async fn open_tracking(
        &self,
        assignment: &WorkerAssignment,
        now: DateTime<Utc>,
    ) -> CoreResult<TrackingSession> {
        self.atomically(|inner| {
            let session = TrackingSession {
                id: inner.next_id(),
                assignment_id: assignment.id,
                booking_id: assignment.booking_id,
                worker_id: assignment.worker_id,
                opened_at: now,
                closed_at: None,
            };
            inner.tracking.push(session.clone());
            if let Some(a) = inner.assignments.get_mut(&assignment.id) {
                a.tracking_session_id = Some(session.id);
            }
            Ok(session)
        })
    }

    async fn close_tracking(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TrackingSession>> {
        let mut inner = self.lock();
        Ok(inner
            .tracking
            .iter_mut()
            .find(|s| s.assignment_id == assignment_id && s.closed_at.is_none())
            .map(|s| {
                s.closed_at = Some(now);
                s.clone()
            }))
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, n: NewNotification, now: DateTime<Utc>) -> CoreResult<Notification> {
        let mut inner = self.lock();
        let notification = Notification {
            id: inner.next_id(),
            user_id: n.user_id,
            kind: n.kind,
            title: n.title,
            body: n.body,
            data: n.data,
            delivered_at: None,
            read_at: None,
            created_at: now,
        };
        inner
            .notifications
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn get(&self, id: NotificationId) -> CoreResult<Option<Notification>> {
        Ok(self.lock().notifications.get(&id).cloned())
    }

    async fn mark_read(&self, id: NotificationId, now: DateTime<Utc>) -> CoreResult<()> {
        if let Some(n) = self.lock().notifications.get_mut(&id) {
            n.read_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: UserId, now: DateTime<Utc>) -> CoreResult<u64> {
        let mut changed = 0;
        for n in self.lock().notifications.values_mut() {
            if n.user_id == user_id && n.read_at.is_none() {
                n.read_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_delivered(&self, id: NotificationId, now: DateTime<Utc>) -> CoreResult<()> {
        if let Some(n) = self.lock().notifications.get_mut(&id) {
            n.delivered_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn unread_count(&self, user_id: UserId) -> CoreResult<i64> {
        Ok(self
            .lock()
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.is_read())
            .count() as i64)
    }

    async fn list(&self, user_id: UserId, query: ListQuery) -> CoreResult<Vec<Notification>> {
        Ok(self
            .lock()
            .notifications
            .values()
            .rev()
            .filter(|n| n.user_id == user_id)
            .filter(|n| !query.unread_only || !n.is_read())
            .filter(|n| query.before_id.is_none_or(|b| n.id < b))
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn device_tokens(&self, user_id: UserId) -> CoreResult<Vec<DeviceToken>> {
        Ok(self
            .lock()
            .devices
            .iter()
            .filter(|d| d.user_id == user_id && d.active)
            .cloned()
            .collect())
    }

    async fn register_device(
        &self,
        user_id: UserId,
        token: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<DeviceToken> {
        let mut inner = self.lock();
        if let Some(d) = inner.devices.iter_mut().find(|d| d.token == token) {
            d.user_id = user_id;
            d.platform = platform.to_string();
            d.active = true;
            d.updated_at = now;
            return Ok(d.clone());
        }
        let device = DeviceToken {
            id: inner.next_id(),
            user_id,
            token: token.to_string(),
            platform: platform.to_string(),
            active: true,
            updated_at: now,
        };
        inner.devices.push(device.clone());
        Ok(device)
    }

    async fn disable_device_token(&self, token: &str, now: DateTime<Utc>) -> CoreResult<()> {
        for d in self.lock().devices.iter_mut().filter(|d| d.token == token) {
            d.active = false;
            d.updated_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(
        &self,
        new: NewConversation,
        now: DateTime<Utc>,
    ) -> CoreResult<Conversation> {
        let mut inner = self.lock();
        let mut participants = new.participants;
        participants.sort_unstable();
        participants.dedup();
        let conversation = Conversation {
            id: inner.next_id(),
            booking_id: new.booking_id,
            participants,
            created_by: new.created_by,
            created_at: now,
            closed_at: None,
        };
        for user_id in &conversation.participants {
            inner.read_markers.insert((conversation.id, *user_id), 0);
        }
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> CoreResult<Option<Conversation>> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Message> {
        let mut inner = self.lock();
        match inner.conversations.get(&conversation_id) {
            None => {
                return Err(CoreError::not_found(format!("conversation {}", conversation_id)));
            }
            Some(c) if c.is_closed() => {
                return Err(CoreError::conflict(format!(
                    "conversation {} is closed",
                    conversation_id
                )));
            }
            Some(_) => {}
        }
        let message = Message {
            id: inner.next_id(),
            conversation_id,
            sender_id,
            content: content.to_string(),
            sent_at: now,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn messages(
        &self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> CoreResult<Vec<Message>> {
        Ok(self
            .lock()
            .messages
            .iter()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| query.before.is_none_or(|b| m.id < b))
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        up_to: MessageId,
        _now: DateTime<Utc>,
    ) -> CoreResult<MessageId> {
        let mut inner = self.lock();
        let marker = inner
            .read_markers
            .get_mut(&(conversation_id, user_id))
            .ok_or_else(|| {
                CoreError::forbidden(format!(
                    "user {} is not in conversation {}",
                    user_id, conversation_id
                ))
            })?;
        *marker = (*marker).max(up_to);
        Ok(*marker)
    }

    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> CoreResult<i64> {
        let inner = self.lock();
        let Some(marker) = inner.read_markers.get(&(conversation_id, user_id)).copied() else {
            return Ok(0);
        };
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id && m.sender_id != user_id && m.id > marker
            })
            .count() as i64)
    }

    async fn close_conversation(
        &self,
        id: ConversationId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Conversation>> {
        let mut inner = self.lock();
        Ok(inner.conversations.get_mut(&id).map(|c| {
            c.closed_at.get_or_insert(now);
            c.clone()
        }))
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load_settings(&self) -> CoreResult<Vec<(String, String)>> {
        Ok(self.lock().settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{BookingKind, new_booking_reference};
    use crate::ledger::EntryKind;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 3, 45, 0).unwrap()
    }

    fn held(service_id: ServiceId, start: DateTime<Utc>) -> NewBooking {
        NewBooking {
            reference: new_booking_reference(),
            customer_id: 1,
            service_id,
            kind: BookingKind::Regular,
            state: BookingState::Held,
            scheduled_start: Some(start),
            scheduled_end: Some(start + Duration::hours(1)),
            address: AddressSnapshot::default(),
            contact: Default::default(),
            notes: None,
            hold_expires_at: Some(start),
        }
    }

    #[tokio::test]
    async fn test_failed_payment_insert_leaves_nothing() {
        let store = MemoryStore::new();
        store.add_customer(1);
        let p = NewPayment::new(
            1,
            dec!(50),
            PaymentKind::WalletDebit,
            crate::payments::PaymentMethod::Wallet,
            PaymentStatus::Completed,
        );
        let err = PaymentStore::insert(&*store, p, vec![LedgerDraft::debit(1, dec!(50), None)], now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds));
        assert!(store.list_for_user(1, 10).await.unwrap().is_empty());
        assert!(LedgerStore::latest(&*store, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_link_to_new_payment() {
        let store = MemoryStore::new();
        store.add_customer(1);
        let p = NewPayment::new(
            1,
            dec!(80),
            PaymentKind::Manual,
            crate::payments::PaymentMethod::Admin,
            PaymentStatus::Completed,
        );
        let (payment, entries) =
            PaymentStore::insert(&*store, p, vec![LedgerDraft::credit(1, dec!(80), None)], now())
                .await
                .unwrap();
        assert_eq!(entries[0].cause_payment_id, Some(payment.id));
        assert_eq!(entries[0].kind, EntryKind::Credit);
        assert_eq!(store.cached_balance(1).await.unwrap(), dec!(80));
    }

    #[tokio::test]
    async fn test_second_hold_on_slot_conflicts() {
        let store = MemoryStore::new();
        let start = now() + Duration::hours(2);
        BookingStore::insert(&*store, held(7, start), now()).await.unwrap();
        let err = BookingStore::insert(&*store, held(7, start), now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConflictingTransition(_)));
        // other service, same window
        BookingStore::insert(&*store, held(8, start), now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_marker_never_moves_back() {
        let store = MemoryStore::new();
        let c = store
            .create_conversation(
                NewConversation {
                    booking_id: None,
                    participants: vec![2, 1, 2],
                    created_by: 1,
                },
                now(),
            )
            .await
            .unwrap();
        assert_eq!(c.participants, vec![1, 2]);
        let m = store.insert_message(c.id, 1, "hi", now()).await.unwrap();
        assert_eq!(ConversationStore::unread_count(&*store, c.id, 2).await.unwrap(), 1);
        assert_eq!(ConversationStore::mark_read(&*store, c.id, 2, m.id, now()).await.unwrap(), m.id);
        assert_eq!(ConversationStore::mark_read(&*store, c.id, 2, 0, now()).await.unwrap(), m.id);
        assert_eq!(ConversationStore::unread_count(&*store, c.id, 2).await.unwrap(), 0);
        assert!(matches!(
            ConversationStore::mark_read(&*store, c.id, 9, m.id, now()).await,
            Err(CoreError::Forbidden(_))
        ));
    }
}
