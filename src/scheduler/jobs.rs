//! Periodic jobs

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use crate::booking::BookingService;
use crate::error::CoreResult;
use crate::ledger::LedgerService;
use crate::payments::PaymentService;

#[async_trait]
pub trait Job: Send + Sync {
    /// Also the lock name.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Returns how many items the run touched.
    async fn run(&self) -> CoreResult<usize>;
}

pub struct ExpireHoldsJob {
    bookings: Arc<BookingService>,
}

impl ExpireHoldsJob {
    pub fn new(bookings: Arc<BookingService>) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl Job for ExpireHoldsJob {
    fn name(&self) -> &'static str {
        "expire_holds"
    }

    fn interval(&self) -> Duration {
        Duration::minutes(1)
    }

    async fn run(&self) -> CoreResult<usize> {
        self.bookings.expire_holds().await
    }
}

pub struct ExpireQuotesJob {
    bookings: Arc<BookingService>,
}

impl ExpireQuotesJob {
    pub fn new(bookings: Arc<BookingService>) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl Job for ExpireQuotesJob {
    fn name(&self) -> &'static str {
        "expire_quotes"
    }

    fn interval(&self) -> Duration {
        Duration::hours(1)
    }

    async fn run(&self) -> CoreResult<usize> {
        self.bookings.expire_quotes().await
    }
}

pub struct WithdrawalRemindersJob {
    payments: Arc<PaymentService>,
}

impl WithdrawalRemindersJob {
    pub fn new(payments: Arc<PaymentService>) -> Self {
        Self { payments }
    }
}

#[async_trait]
impl Job for WithdrawalRemindersJob {
    fn name(&self) -> &'static str {
        "withdrawal_reminders"
    }

    fn interval(&self) -> Duration {
        Duration::hours(6)
    }

    async fn run(&self) -> CoreResult<usize> {
        self.payments.withdrawal_reminders().await
    }
}

/// Settles gateway checkouts whose capture never reached us.
pub struct ReconcilePendingPaymentsJob {
    payments: Arc<PaymentService>,
}

impl ReconcilePendingPaymentsJob {
    pub fn new(payments: Arc<PaymentService>) -> Self {
        Self { payments }
    }
}

#[async_trait]
impl Job for ReconcilePendingPaymentsJob {
    fn name(&self) -> &'static str {
        "reconcile_pending_payments"
    }

    fn interval(&self) -> Duration {
        Duration::minutes(5)
    }

    async fn run(&self) -> CoreResult<usize> {
        self.payments.reconcile_pending().await
    }
}

/// Compares every cached wallet balance with its ledger chain head.
pub struct ReconcileBalancesJob {
    ledger: Arc<LedgerService>,
}

impl ReconcileBalancesJob {
    pub fn new(ledger: Arc<LedgerService>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Job for ReconcileBalancesJob {
    fn name(&self) -> &'static str {
        "reconcile_balances"
    }

    fn interval(&self) -> Duration {
        Duration::days(1)
    }

    async fn run(&self) -> CoreResult<usize> {
        let drifts = self.ledger.reconcile_all().await?;
        for d in &drifts {
            tracing::error!(
                target: "AUDIT",
                user_id = d.user_id,
                cached_balance = %d.cached_balance,
                chain_balance = ?d.chain_balance,
                "Wallet balance drifted from ledger"
            );
        }
        Ok(drifts.len())
    }
}
