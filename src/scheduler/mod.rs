//! Periodic background jobs: hold and quote expiry, withdrawal reminders,
//! settling stale gateway checkouts and the daily balance reconciliation.

pub mod jobs;
pub mod lock;
pub mod runner;

pub use jobs::{
    ExpireHoldsJob, ExpireQuotesJob, Job, ReconcileBalancesJob, ReconcilePendingPaymentsJob,
    WithdrawalRemindersJob,
};
pub use lock::{JobLock, LocalJobLock, PgJobLock};
pub use runner::{JobOutcome, JobReport, Scheduler, SchedulerConfig};
