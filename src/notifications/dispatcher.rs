//! Push dispatcher
//!
//! Request paths enqueue push jobs on a bounded lock-free queue and move
//! on. The dispatcher drains it, retries transient failures with
//! exponential backoff and disables tokens that fail terminally.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam_queue::ArrayQueue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::db::NotificationStore;
use super::push::{PushError, PushMessage, PushProvider};
use crate::core_types::{NotificationId, UserId};
use crate::env::Environment;

#[derive(Debug, Clone, PartialEq)]
pub struct PushJob {
    pub notification_id: NotificationId,
    pub user_id: UserId,
    pub token: String,
    pub message: PushMessage,
    /// Failed attempts so far
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub base_backoff: ChronoDuration,
    pub max_backoff: ChronoDuration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            poll_interval: Duration::from_millis(200),
            batch_size: 256,
            base_backoff: ChronoDuration::seconds(1),
            max_backoff: ChronoDuration::minutes(5),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: usize,
    pub retried: usize,
    pub disabled: usize,
}

pub struct PushDispatcher {
    env: Environment,
    store: Arc<dyn NotificationStore>,
    provider: Arc<dyn PushProvider>,
    queue: ArrayQueue<PushJob>,
    /// Jobs waiting out their backoff
    delayed: Mutex<Vec<PushJob>>,
    config: DispatcherConfig,
}

impl PushDispatcher {
    pub fn new(
        env: Environment,
        store: Arc<dyn NotificationStore>,
        provider: Arc<dyn PushProvider>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            env,
            store,
            provider,
            queue: ArrayQueue::new(config.queue_capacity.max(1)),
            delayed: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Best effort: a full queue drops the job.
    pub fn enqueue(&self, job: PushJob) -> bool {
        match self.queue.push(job) {
            Ok(()) => true,
            Err(job) => {
                warn!(
                    notification_id = job.notification_id,
                    user_id = job.user_id,
                    "Push queue full, dropping push"
                );
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len() + self.delayed.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Delay before attempt number `attempts + 1`.
    pub fn backoff(&self, attempts: u32) -> ChronoDuration {
        let factor = 1i32.checked_shl(attempts.min(20)).unwrap_or(i32::MAX);
        let delay = self.config.base_backoff * factor;
        delay.min(self.config.max_backoff)
    }

    /// Drain one batch: due retries first, then fresh jobs.
    pub async fn process_once(&self) -> DispatchStats {
        let now = self.env.now();
        let max_attempts = self.env.settings.booking().await.push_retry_max.max(1);

        let mut batch = {
            let mut delayed = self.delayed.lock().unwrap_or_else(|p| p.into_inner());
            let (due, waiting): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|j| j.not_before <= now);
            *delayed = waiting;
            due
        };
        while batch.len() < self.config.batch_size {
            match self.queue.pop() {
                Some(job) => batch.push(job),
                None => break,
            }
        }

        let mut stats = DispatchStats::default();
        for mut job in batch {
            match self.provider.send(&job.token, &job.message).await {
                Ok(()) => {
                    stats.sent += 1;
                    if let Err(e) = self.store.mark_delivered(job.notification_id, now).await {
                        error!(notification_id = job.notification_id, error = %e, "Failed to mark notification delivered");
                    }
                }
                Err(PushError::Transient(reason)) if job.attempts + 1 < max_attempts => {
                    job.attempts += 1;
                    job.not_before = now + self.backoff(job.attempts);
                    debug!(
                        notification_id = job.notification_id,
                        attempts = job.attempts,
                        %reason,
                        "Push failed, scheduling retry"
                    );
                    stats.retried += 1;
                    self.delayed
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(job);
                }
                Err(e) => {
                    warn!(
                        notification_id = job.notification_id,
                        user_id = job.user_id,
                        provider = self.provider.name(),
                        error = %e,
                        "Push failed terminally, disabling device token"
                    );
                    stats.disabled += 1;
                    if let Err(e) = self.store.disable_device_token(&job.token, now).await {
                        error!(error = %e, "Failed to disable device token");
                    }
                }
            }
        }
        stats
    }

    pub async fn run(&self) -> ! {
        info!(
            provider = self.provider.name(),
            capacity = self.config.queue_capacity,
            "Starting push dispatcher"
        );
        loop {
            let stats = self.process_once().await;
            if stats != DispatchStats::default() {
                debug!(?stats, "Push batch processed");
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
