//! Payment Service
//!
//! Orchestrates money across the gateway, the wallet ledger and the
//! entities being paid for. Every status change is a compare-and-set in
//! the store, carrying its ledger entries in the same transaction.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::{Arc, RwLock};

use super::db::PaymentStore;
use super::types::{
    CreateOrder, NewPayment, OrderCreated, Payment, PaymentKind, PaymentMethod, PaymentRelation,
    PaymentStatus, PaymentTransition, RefundResult, TransitionOutcome, WebhookOutcome,
};
use crate::account::{AccountService, ActorKind};
use crate::core_types::{PaymentId, UserId};
use crate::env::Environment;
use crate::error::{CoreError, CoreResult};
use crate::ledger::LedgerDraft;
use crate::money;
use crate::notifications::{NewNotification, NotificationKind, NotificationService};
use crate::payment_gateway::{PaymentGateway, PayoutRequest, WebhookEventKind, parse_event};

/// Age at which a pending checkout is re-checked with the gateway
const PENDING_RECHECK_MINUTES: i64 = 10;

/// Age at which a pending checkout with nothing paid is failed
const PENDING_ABANDON_HOURS: i64 = 24;

const RECHECK_BATCH: i64 = 200;

/// Side effects owned by other modules. Called after the status change
/// commits, and again on idempotent replays, so implementations must be
/// idempotent themselves.
#[async_trait]
pub trait PaymentListener: Send + Sync {
    async fn on_completed(&self, _payment: &Payment) -> CoreResult<()> {
        Ok(())
    }

    async fn on_cancelled(&self, _payment: &Payment) -> CoreResult<()> {
        Ok(())
    }
}

/// Activates the plan bought by a completed `subscription` payment.
pub struct SubscriptionActivator {
    accounts: Arc<AccountService>,
}

impl SubscriptionActivator {
    pub fn new(accounts: Arc<AccountService>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl PaymentListener for SubscriptionActivator {
    async fn on_completed(&self, payment: &Payment) -> CoreResult<()> {
        if payment.kind != PaymentKind::Subscription {
            return Ok(());
        }
        let Some(PaymentRelation::SubscriptionPlan(plan_id)) = payment.relation else {
            return Err(CoreError::internal(format!(
                "subscription payment {} has no plan",
                payment.id
            )));
        };
        self.accounts
            .activate_subscription(payment.user_id, plan_id, payment.id)
            .await?;
        Ok(())
    }
}

pub struct PaymentService {
    env: Environment,
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    accounts: Arc<AccountService>,
    notifications: Arc<NotificationService>,
    listeners: RwLock<Vec<Arc<dyn PaymentListener>>>,
}

impl PaymentService {
    pub fn new(
        env: Environment,
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        accounts: Arc<AccountService>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            env,
            store,
            gateway,
            accounts,
            notifications,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PaymentListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn PaymentListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn notify_completed(&self, payment: &Payment) -> CoreResult<()> {
        for l in self.listeners() {
            l.on_completed(payment).await?;
        }
        Ok(())
    }

    async fn notify_cancelled(&self, payment: &Payment) -> CoreResult<()> {
        for l in self.listeners() {
            l.on_cancelled(payment).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: PaymentId) -> CoreResult<Payment> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("payment {}", id)))
    }

    /// Payment visible to `user_id` (owner or admin).
    pub async fn get_for(&self, user_id: UserId, id: PaymentId) -> CoreResult<Payment> {
        let payment = self.get(id).await?;
        if payment.user_id != user_id && !self.accounts.actor(user_id).await?.is_admin() {
            return Err(CoreError::forbidden(format!("payment {} is not yours", id)));
        }
        Ok(payment)
    }

    pub async fn list_for_user(&self, user_id: UserId, limit: i64) -> CoreResult<Vec<Payment>> {
        self.store.list_for_user(user_id, limit.clamp(1, 200)).await
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Open a payment. Gateway payments come back `pending` with a checkout
    /// order; wallet payments are debited and completed immediately.
    pub async fn create_order(&self, req: CreateOrder) -> CoreResult<OrderCreated> {
        let amount = money::normalize_positive(req.amount)?;
        if !req.kind.is_orderable() {
            return Err(CoreError::validation(format!(
                "{} payments cannot be ordered directly",
                req.kind
            )));
        }
        self.accounts.actor(req.user_id).await?;

        if req.kind == PaymentKind::Subscription {
            let Some(PaymentRelation::SubscriptionPlan(plan_id)) = req.relation else {
                return Err(CoreError::validation("subscription payment needs a plan"));
            };
            let plan = self
                .accounts
                .store()
                .get_plan(plan_id)
                .await?
                .filter(|p| p.active)
                .ok_or_else(|| CoreError::not_found(format!("subscription plan {}", plan_id)))?;
            if plan.price != amount {
                return Err(CoreError::validation(format!(
                    "plan {} costs {}, got {}",
                    plan_id, plan.price, amount
                )));
            }
        }

        match req.method {
            PaymentMethod::Gateway => self.create_gateway_order(req, amount).await,
            PaymentMethod::Wallet => {
                if req.kind == PaymentKind::WalletRecharge {
                    return Err(CoreError::validation("a wallet cannot recharge itself"));
                }
                self.create_wallet_payment(req, amount).await
            }
            PaymentMethod::Cash | PaymentMethod::Admin => Err(CoreError::validation(format!(
                "{} payments are recorded by admins, not ordered",
                req.method
            ))),
        }
    }

    async fn create_gateway_order(
        &self,
        req: CreateOrder,
        amount: Decimal,
    ) -> CoreResult<OrderCreated> {
        let new = NewPayment::new(
            req.user_id,
            amount,
            req.kind,
            PaymentMethod::Gateway,
            PaymentStatus::Pending,
        )
        .related_to(req.relation)
        .with_notes(req.description.clone());
        let (mut payment, _) = self.store.insert(new, Vec::new(), self.env.now()).await?;

        let order = self
            .gateway
            .create_order(
                money::to_minor_units(amount)?,
                &payment.reference,
                req.description.as_deref(),
            )
            .await?;
        self.store
            .set_gateway_order(payment.id, &order.order_id, self.env.now())
            .await?;
        payment.gateway_order_id = Some(order.order_id.clone());

        tracing::info!(
            payment_id = payment.id,
            reference = %payment.reference,
            kind = %payment.kind,
            amount = %payment.amount,
            order_id = %order.order_id,
            "Gateway order created"
        );
        Ok(OrderCreated {
            payment,
            gateway_order: Some(order),
        })
    }

    async fn create_wallet_payment(
        &self,
        req: CreateOrder,
        amount: Decimal,
    ) -> CoreResult<OrderCreated> {
        let new = NewPayment::new(
            req.user_id,
            amount,
            req.kind,
            PaymentMethod::Wallet,
            PaymentStatus::Completed,
        )
        .related_to(req.relation)
        .with_notes(req.description);
        let (payment, entries) = self
            .store
            .insert(
                new,
                vec![LedgerDraft::debit(req.user_id, amount, None)],
                self.env.now(),
            )
            .await?;

        tracing::info!(
            payment_id = payment.id,
            user_id = payment.user_id,
            amount = %payment.amount,
            new_balance = %entries.last().map(|e| e.new_balance).unwrap_or_default(),
            "Wallet payment completed"
        );
        self.notify_completed(&payment).await?;
        Ok(OrderCreated {
            payment,
            gateway_order: None,
        })
    }

    // ========================================================================
    // Capture
    // ========================================================================

    /// Verify a checkout callback and complete the payment.
    ///
    /// Idempotent on `gateway_payment_id`: a replay returns the payment as
    /// it stands.
    pub async fn verify_and_complete(
        &self,
        payment_id: PaymentId,
        gateway_payment_id: &str,
        signature: &str,
    ) -> CoreResult<Payment> {
        let payment = self.get(payment_id).await?;
        if payment.gateway_payment_id.as_deref() == Some(gateway_payment_id) {
            if payment.status == PaymentStatus::Completed {
                self.notify_completed(&payment).await?;
            }
            return Ok(payment);
        }
        if payment.status != PaymentStatus::Pending {
            return Err(CoreError::AlreadyTerminal(format!(
                "payment {} is {}",
                payment.id, payment.status
            )));
        }
        let order_id = payment
            .gateway_order_id
            .clone()
            .ok_or_else(|| CoreError::validation("payment has no gateway order"))?;

        self.gateway
            .verify_payment_signature(&order_id, gateway_payment_id, signature)
            .inspect_err(|_| {
                tracing::warn!(payment_id, gateway_payment_id, "Checkout signature mismatch");
            })?;

        let captured = self.gateway.fetch_payment(gateway_payment_id).await?;
        if captured.order_id.as_deref().is_some_and(|o| o != order_id) {
            tracing::warn!(payment_id, gateway_payment_id, "Gateway payment belongs to another order");
            return Err(CoreError::SignatureMismatch);
        }
        if !captured.status.is_paid() {
            return Err(CoreError::validation(format!(
                "gateway reports payment {} as {:?}",
                gateway_payment_id, captured.status
            )));
        }
        self.complete_captured(payment, gateway_payment_id, captured.amount_minor)
            .await
    }

    async fn complete_captured(
        &self,
        payment: Payment,
        gateway_payment_id: &str,
        captured_minor: i64,
    ) -> CoreResult<Payment> {
        let actual = money::from_minor_units(captured_minor);
        if actual < payment.amount {
            tracing::warn!(
                payment_id = payment.id,
                expected = %payment.amount,
                actual = %actual,
                "Captured amount below payment amount"
            );
            return Err(CoreError::AmountMismatch {
                expected: payment.amount,
                actual,
            });
        }

        let mut t = PaymentTransition::new(
            payment.id,
            PaymentStatus::Pending,
            PaymentStatus::Completed,
        )
        .gateway_payment_id(gateway_payment_id);
        if payment.kind == PaymentKind::WalletRecharge {
            t = t.entry(LedgerDraft::credit(
                payment.user_id,
                payment.amount,
                Some(payment.id),
            ));
        }

        let completed = match self.store.transition(t, self.env.now()).await? {
            TransitionOutcome::Applied(applied) => applied.payment,
            TransitionOutcome::Stale(current)
                if current.gateway_payment_id.as_deref() == Some(gateway_payment_id) =>
            {
                current
            }
            TransitionOutcome::Stale(current) => {
                return Err(CoreError::conflict(format!(
                    "payment {} is {}",
                    current.id, current.status
                )));
            }
        };

        tracing::info!(
            payment_id = completed.id,
            kind = %completed.kind,
            gateway_payment_id,
            "Payment completed"
        );
        if completed.status == PaymentStatus::Completed {
            self.notify_completed(&completed).await?;
        }
        Ok(completed)
    }

    // ========================================================================
    // Cancel / refund / adjust
    // ========================================================================

    /// Cancel a pending payment. Owner or admin.
    pub async fn cancel(&self, payment_id: PaymentId, user_id: UserId) -> CoreResult<Payment> {
        let payment = self.get_for(user_id, payment_id).await?;
        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Cancelled => return Ok(payment),
            other => {
                return Err(CoreError::conflict(format!(
                    "payment {} is {}, only pending payments can be cancelled",
                    payment_id, other
                )));
            }
        }
        if payment.kind == PaymentKind::Withdrawal {
            return Err(CoreError::validation(
                "withdrawals are cancelled by rejecting them",
            ));
        }

        let t = PaymentTransition::new(payment_id, PaymentStatus::Pending, PaymentStatus::Cancelled)
            .notes(format!("cancelled by user {}", user_id));
        let cancelled = match self.store.transition(t, self.env.now()).await? {
            TransitionOutcome::Applied(a) => a.payment,
            TransitionOutcome::Stale(current) if current.status == PaymentStatus::Cancelled => {
                return Ok(current);
            }
            TransitionOutcome::Stale(current) => {
                return Err(CoreError::conflict(format!(
                    "payment {} is {}",
                    current.id, current.status
                )));
            }
        };
        tracing::info!(payment_id, user_id, "Payment cancelled");
        self.notify_cancelled(&cancelled).await?;
        Ok(cancelled)
    }

    /// Refund a completed payment to the payer's wallet. `amount` defaults
    /// to the full amount; one refund closes the payment.
    pub async fn refund(
        &self,
        payment_id: PaymentId,
        amount: Option<Decimal>,
        notes: &str,
    ) -> CoreResult<RefundResult> {
        let payment = self.get(payment_id).await?;
        match payment.status {
            PaymentStatus::Completed => {}
            PaymentStatus::Refunded => {
                return Err(CoreError::AlreadyTerminal(format!(
                    "payment {} is already refunded",
                    payment_id
                )));
            }
            other => {
                return Err(CoreError::conflict(format!(
                    "payment {} is {}, only completed payments can be refunded",
                    payment_id, other
                )));
            }
        }
        if matches!(payment.kind, PaymentKind::Refund | PaymentKind::Withdrawal) {
            return Err(CoreError::validation(format!(
                "{} payments cannot be refunded",
                payment.kind
            )));
        }
        let amount = money::normalize_positive(amount.unwrap_or(payment.amount))?;
        if amount > payment.amount {
            return Err(CoreError::validation(format!(
                "refund {} exceeds payment amount {}",
                amount, payment.amount
            )));
        }

        let refund_row = NewPayment::new(
            payment.user_id,
            amount,
            PaymentKind::Refund,
            PaymentMethod::Wallet,
            PaymentStatus::Completed,
        )
        .related_to(Some(PaymentRelation::Payment(payment.id)))
        .with_notes(Some(notes.to_string()));

        let t = PaymentTransition::new(payment_id, PaymentStatus::Completed, PaymentStatus::Refunded)
            .notes(notes)
            .entry(LedgerDraft::credit(payment.user_id, amount, Some(payment.id)))
            .companion(refund_row);

        let applied = match self.store.transition(t, self.env.now()).await? {
            TransitionOutcome::Applied(a) => a,
            TransitionOutcome::Stale(current) => {
                return Err(CoreError::AlreadyTerminal(format!(
                    "payment {} is {}",
                    current.id, current.status
                )));
            }
        };
        let refund = applied
            .companion
            .ok_or_else(|| CoreError::internal("refund row missing after transition"))?;
        let entry = applied
            .entries
            .first()
            .ok_or_else(|| CoreError::internal("refund credit missing after transition"))?;

        tracing::info!(
            payment_id,
            refund_payment_id = refund.id,
            amount = %amount,
            user_id = payment.user_id,
            "Payment refunded to wallet"
        );
        Ok(RefundResult {
            original: applied.payment,
            refund,
            ledger_entry_id: entry.id,
        })
    }

    /// Manual wallet correction. Positive credits, negative debits.
    pub async fn admin_adjust(
        &self,
        admin_id: UserId,
        user_id: UserId,
        signed_amount: Decimal,
        reason: &str,
    ) -> CoreResult<Payment> {
        self.accounts.require_admin(admin_id).await?;
        self.accounts.actor(user_id).await?;
        if reason.trim().is_empty() {
            return Err(CoreError::validation("adjustment reason is required"));
        }
        let signed_amount = money::normalize(signed_amount)?;
        if signed_amount.is_zero() {
            return Err(CoreError::validation("adjustment amount must not be zero"));
        }

        let new = NewPayment::new(
            user_id,
            signed_amount.abs(),
            PaymentKind::Manual,
            PaymentMethod::Admin,
            PaymentStatus::Completed,
        )
        .with_notes(Some(format!("{} (admin {})", reason.trim(), admin_id)));
        let (payment, _) = self
            .store
            .insert(
                new,
                vec![LedgerDraft::adjust(user_id, signed_amount, None)],
                self.env.now(),
            )
            .await?;

        tracing::info!(admin_id, user_id, amount = %signed_amount, payment_id = payment.id, "Wallet adjusted by admin");
        Ok(payment)
    }

    // ========================================================================
    // Withdrawals
    // ========================================================================

    /// Worker asks to cash out; the amount is frozen until an admin decides.
    pub async fn withdrawal_request(
        &self,
        worker_id: UserId,
        amount: Decimal,
        notes: Option<String>,
    ) -> CoreResult<Payment> {
        self.accounts
            .require_kind(worker_id, ActorKind::Worker)
            .await?;
        let amount = money::normalize_positive(amount)?;

        let new = NewPayment::new(
            worker_id,
            amount,
            PaymentKind::Withdrawal,
            PaymentMethod::Wallet,
            PaymentStatus::Pending,
        )
        .with_notes(notes);
        let (payment, _) = self
            .store
            .insert(
                new,
                vec![LedgerDraft::hold(worker_id, amount, None)],
                self.env.now(),
            )
            .await?;

        tracing::info!(worker_id, payment_id = payment.id, amount = %amount, "Withdrawal requested");
        let admins = self.accounts.admin_ids().await.unwrap_or_default();
        self.notifications
            .create_many(
                admins
                    .into_iter()
                    .map(|admin| {
                        NewNotification::new(
                            admin,
                            NotificationKind::WithdrawalRequested,
                            "Withdrawal requested",
                            format!("Worker {} requested ₹{}", worker_id, amount),
                        )
                        .with_data(json!({ "payment_id": payment.id }))
                    })
                    .collect(),
            )
            .await;
        Ok(payment)
    }

    async fn pending_withdrawal(&self, payment_id: PaymentId) -> CoreResult<Payment> {
        let payment = self.get(payment_id).await?;
        if payment.kind != PaymentKind::Withdrawal {
            return Err(CoreError::validation(format!(
                "payment {} is not a withdrawal",
                payment_id
            )));
        }
        match payment.status {
            PaymentStatus::Pending => Ok(payment),
            PaymentStatus::Processing => Err(CoreError::conflict(format!(
                "withdrawal {} is being paid out",
                payment_id
            ))),
            other => Err(CoreError::AlreadyTerminal(format!(
                "withdrawal {} is {}",
                payment_id, other
            ))),
        }
    }

    fn stale_withdrawal(current: &Payment) -> CoreError {
        match current.status {
            PaymentStatus::Processing => CoreError::conflict(format!(
                "withdrawal {} is being paid out",
                current.id
            )),
            other => CoreError::AlreadyTerminal(format!("withdrawal {} is {}", current.id, other)),
        }
    }

    /// Claim the withdrawal, pay out, then turn the hold into a final
    /// debit. A failed payout puts the withdrawal back to `pending`.
    pub async fn withdrawal_approve(
        &self,
        admin_id: UserId,
        payment_id: PaymentId,
    ) -> CoreResult<Payment> {
        self.accounts.require_admin(admin_id).await?;
        let payment = self.pending_withdrawal(payment_id).await?;
        let amount_minor = money::to_minor_units(payment.amount)?;

        let claim = PaymentTransition::new(payment_id, PaymentStatus::Pending, PaymentStatus::Processing);
        let payment = match self.store.transition(claim, self.env.now()).await? {
            TransitionOutcome::Applied(a) => a.payment,
            TransitionOutcome::Stale(current) => return Err(Self::stale_withdrawal(&current)),
        };

        let payout = self
            .gateway
            .payout(&PayoutRequest {
                reference: payment.reference.clone(),
                user_id: payment.user_id,
                amount_minor,
                narration: format!("TreesIndia withdrawal {}", payment.reference),
            })
            .await;
        let payout_id = match payout {
            Ok(id) => id,
            Err(e) => {
                let reopen =
                    PaymentTransition::new(payment_id, PaymentStatus::Processing, PaymentStatus::Pending);
                if let Err(re) = self.store.transition(reopen, self.env.now()).await {
                    tracing::error!(payment_id, error = %re, "Failed to reopen withdrawal after payout error");
                }
                tracing::warn!(admin_id, payment_id, error = %e, "Payout failed, withdrawal reopened");
                return Err(e);
            }
        };

        let t = PaymentTransition::new(payment_id, PaymentStatus::Processing, PaymentStatus::Completed)
            .gateway_payment_id(payout_id.clone())
            .notes(format!("approved by admin {}", admin_id))
            .entry(LedgerDraft::release(payment.user_id, payment.amount, Some(payment.id)))
            .entry(LedgerDraft::debit(payment.user_id, payment.amount, Some(payment.id)));

        let approved = match self.store.transition(t, self.env.now()).await? {
            TransitionOutcome::Applied(a) => a.payment,
            TransitionOutcome::Stale(current) => {
                tracing::error!(
                    target: "AUDIT",
                    payment_id,
                    payout_id = %payout_id,
                    status = %current.status,
                    "Payout issued but withdrawal left processing"
                );
                return Err(CoreError::internal(format!(
                    "withdrawal {} moved to {} during payout {}",
                    payment_id, current.status, payout_id
                )));
            }
        };

        tracing::info!(admin_id, payment_id, payout_id = %payout_id, "Withdrawal approved");
        self.notify_worker(&approved, NotificationKind::WithdrawalApproved, "Withdrawal approved")
            .await;
        Ok(approved)
    }

    pub async fn withdrawal_reject(
        &self,
        admin_id: UserId,
        payment_id: PaymentId,
        reason: &str,
    ) -> CoreResult<Payment> {
        self.accounts.require_admin(admin_id).await?;
        if reason.trim().is_empty() {
            return Err(CoreError::validation("rejection reason is required"));
        }
        let payment = self.pending_withdrawal(payment_id).await?;

        let t = PaymentTransition::new(payment_id, PaymentStatus::Pending, PaymentStatus::Cancelled)
            .notes(reason.trim())
            .entry(LedgerDraft::release(payment.user_id, payment.amount, Some(payment.id)));
        let rejected = match self.store.transition(t, self.env.now()).await? {
            TransitionOutcome::Applied(a) => a.payment,
            TransitionOutcome::Stale(current) => return Err(Self::stale_withdrawal(&current)),
        };

        tracing::info!(admin_id, payment_id, "Withdrawal rejected");
        self.notify_worker(&rejected, NotificationKind::WithdrawalRejected, "Withdrawal rejected")
            .await;
        Ok(rejected)
    }

    async fn notify_worker(&self, payment: &Payment, kind: NotificationKind, title: &str) {
        let body = match &payment.notes {
            Some(n) => format!("₹{}: {}", payment.amount, n),
            None => format!("₹{}", payment.amount),
        };
        let item = NewNotification::new(payment.user_id, kind, title, body)
            .with_data(json!({ "payment_id": payment.id }));
        if let Err(e) = self.notifications.create(item).await {
            tracing::error!(payment_id = payment.id, error = %e, "Failed to notify worker");
        }
    }

    /// Scheduler sweep: remind admins about old pending withdrawals.
    pub async fn withdrawal_reminders(&self) -> CoreResult<usize> {
        let age = self.env.settings.booking().await.withdrawal_reminder_age_hours;
        let cutoff = self.env.now() - chrono::Duration::hours(age);
        let stale = self.store.pending_withdrawals_older_than(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }
        let total: Decimal = stale.iter().map(|p| p.amount).sum();
        let admins = self.accounts.admin_ids().await?;
        let ids: Vec<PaymentId> = stale.iter().map(|p| p.id).collect();
        self.notifications
            .create_many(
                admins
                    .into_iter()
                    .map(|admin| {
                        NewNotification::new(
                            admin,
                            NotificationKind::WithdrawalReminder,
                            "Pending withdrawals",
                            format!(
                                "{} withdrawals totalling ₹{} waiting over {}h",
                                ids.len(),
                                total,
                                age
                            ),
                        )
                        .with_data(json!({ "payment_ids": ids }))
                    })
                    .collect(),
            )
            .await;
        tracing::info!(count = stale.len(), total = %total, "Withdrawal reminders sent");
        Ok(stale.len())
    }

    /// Scheduler sweep: settle gateway checkouts left `pending`.
    ///
    /// A paid attempt on the order completes the payment. A payment whose
    /// order was never created fails, and so does one with nothing paid
    /// after [`PENDING_ABANDON_HOURS`]. Gateway errors leave the payment
    /// for the next run.
    pub async fn reconcile_pending(&self) -> CoreResult<usize> {
        let now = self.env.now();
        let cutoff = now - chrono::Duration::minutes(PENDING_RECHECK_MINUTES);
        let stale = self
            .store
            .pending_gateway_payments_older_than(cutoff, RECHECK_BATCH)
            .await?;
        let mut settled = 0;
        for payment in stale {
            let payment_id = payment.id;
            match self.recheck_pending(payment, now).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(payment_id, error = %e, "Pending payment recheck failed");
                }
            }
        }
        if settled > 0 {
            tracing::info!(settled, "Settled stale pending payments");
        }
        Ok(settled)
    }

    async fn recheck_pending(
        &self,
        payment: Payment,
        now: chrono::DateTime<chrono::Utc>,
    ) -> CoreResult<bool> {
        let Some(order_id) = payment.gateway_order_id.clone() else {
            return self.fail_pending(&payment, "gateway order was never created").await;
        };
        let attempts = self.gateway.order_payments(&order_id).await?;
        if let Some(paid) = attempts.iter().find(|p| p.status.is_paid()) {
            tracing::info!(
                payment_id = payment.id,
                gateway_payment_id = %paid.payment_id,
                "Found capture for pending payment"
            );
            self.complete_captured(payment, &paid.payment_id, paid.amount_minor)
                .await?;
            return Ok(true);
        }
        if payment.created_at <= now - chrono::Duration::hours(PENDING_ABANDON_HOURS) {
            return self.fail_pending(&payment, "nothing paid against the order").await;
        }
        Ok(false)
    }

    async fn fail_pending(&self, payment: &Payment, why: &str) -> CoreResult<bool> {
        let t = PaymentTransition::new(payment.id, PaymentStatus::Pending, PaymentStatus::Failed)
            .notes(why);
        match self.store.transition(t, self.env.now()).await? {
            TransitionOutcome::Applied(_) => {
                tracing::info!(payment_id = payment.id, reason = why, "Pending payment failed");
                Ok(true)
            }
            TransitionOutcome::Stale(_) => Ok(false),
        }
    }

    // ========================================================================
    // Webhook
    // ========================================================================

    /// Re-runs the completion hooks for a capture seen again, so side
    /// effects that failed after the status change get another go.
    async fn replay_completed(&self, payment: &Payment, gateway_payment_id: &str) -> CoreResult<()> {
        if payment.status == PaymentStatus::Completed
            && payment.gateway_payment_id.as_deref() == Some(gateway_payment_id)
        {
            self.notify_completed(payment).await?;
        }
        Ok(())
    }

    pub async fn handle_webhook(&self, body: &[u8], signature: &str) -> CoreResult<WebhookOutcome> {
        self.gateway.verify_webhook_signature(body, signature)?;
        let event = parse_event(body)?;
        let kind = event.kind.as_str().to_string();

        if self
            .store
            .webhook_event_seen(&kind, &event.payment_id)
            .await?
        {
            tracing::debug!(event = %kind, gateway_payment_id = %event.payment_id, "Duplicate webhook");
            if event.kind == WebhookEventKind::PaymentCaptured
                && let Some(order_id) = &event.order_id
                && let Some(payment) = self.store.get_by_order_id(order_id).await?
            {
                self.replay_completed(&payment, &event.payment_id).await?;
            }
            return Ok(WebhookOutcome::Duplicate);
        }

        let payment = match &event.order_id {
            Some(order_id) => self.store.get_by_order_id(order_id).await?,
            None => None,
        };
        let Some(payment) = payment else {
            tracing::warn!(event = %kind, gateway_payment_id = %event.payment_id, "Webhook for unknown order");
            return Ok(WebhookOutcome::Ignored("unknown order".into()));
        };

        let outcome = match event.kind {
            WebhookEventKind::PaymentCaptured => {
                if payment.status == PaymentStatus::Pending {
                    self.complete_captured(payment.clone(), &event.payment_id, event.amount_minor)
                        .await?;
                    WebhookOutcome::Processed(payment.id)
                } else if payment.gateway_payment_id.as_deref() == Some(event.payment_id.as_str()) {
                    self.replay_completed(&payment, &event.payment_id).await?;
                    WebhookOutcome::Duplicate
                } else {
                    WebhookOutcome::Ignored(format!("payment is {}", payment.status))
                }
            }
            WebhookEventKind::PaymentFailed => {
                if payment.status == PaymentStatus::Pending {
                    let t = PaymentTransition::new(
                        payment.id,
                        PaymentStatus::Pending,
                        PaymentStatus::Failed,
                    )
                    .notes(format!("gateway reported {}", event.status));
                    self.store.transition(t, self.env.now()).await?;
                    tracing::info!(payment_id = payment.id, "Payment failed at gateway");
                    WebhookOutcome::Processed(payment.id)
                } else {
                    WebhookOutcome::Ignored(format!("payment is {}", payment.status))
                }
            }
            WebhookEventKind::Other(name) => WebhookOutcome::Ignored(name),
        };

        self.store
            .record_webhook_event(&kind, &event.payment_id, self.env.now())
            .await?;
        Ok(outcome)
    }
}
