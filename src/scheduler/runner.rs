//! Scheduler
//!
//! One driver loop for every periodic job. Each tick runs the jobs whose
//! interval has elapsed, one after another, each under its named lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

use super::jobs::Job;
use super::lock::JobLock;
use crate::env::Environment;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due jobs are checked
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Ran(usize),
    /// Another holder had the lock
    Busy,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub name: &'static str,
    pub outcome: JobOutcome,
}

pub struct Scheduler {
    env: Environment,
    lock: Arc<dyn JobLock>,
    jobs: Vec<Arc<dyn Job>>,
    last_run: Mutex<HashMap<&'static str, DateTime<Utc>>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(env: Environment, lock: Arc<dyn JobLock>, config: SchedulerConfig) -> Self {
        Self {
            env,
            lock,
            jobs: Vec::new(),
            last_run: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        info!(job = job.name(), interval_secs = job.interval().num_seconds(), "Job registered");
        self.jobs.push(job);
    }

    fn is_due(&self, job: &dyn Job, now: DateTime<Utc>) -> bool {
        self.last_run
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(job.name())
            .is_none_or(|last| now - *last >= job.interval())
    }

    fn mark_ran(&self, name: &'static str, at: DateTime<Utc>) {
        self.last_run
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, at);
    }

    /// Run every due job once.
    pub async fn run_due(&self) -> Vec<JobReport> {
        let mut reports = Vec::new();
        for job in &self.jobs {
            let now = self.env.now();
            if !self.is_due(job.as_ref(), now) {
                continue;
            }
            // a busy lock means another process has this slot
            self.mark_ran(job.name(), now);
            let outcome = self.run_locked(job.as_ref()).await;
            reports.push(JobReport {
                name: job.name(),
                outcome,
            });
        }
        reports
    }

    async fn run_locked(&self, job: &dyn Job) -> JobOutcome {
        let name = job.name();
        match self.lock.try_acquire(name).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job = name, "Job lock busy, skipping");
                return JobOutcome::Busy;
            }
            Err(e) => {
                error!(job = name, error = %e, "Failed to take job lock");
                return JobOutcome::Failed(e.to_string());
            }
        }

        let started = std::time::Instant::now();
        let outcome = match job.run().await {
            Ok(n) => {
                if n > 0 {
                    info!(job = name, items = n, elapsed_ms = started.elapsed().as_millis() as u64, "Job finished");
                } else {
                    debug!(job = name, "Job finished, nothing to do");
                }
                JobOutcome::Ran(n)
            }
            Err(e) => {
                error!(job = name, error = %e, "Job failed");
                JobOutcome::Failed(e.to_string())
            }
        };

        if let Err(e) = self.lock.release(name).await {
            error!(job = name, error = %e, "Failed to release job lock");
        }
        outcome
    }

    /// Runs forever.
    pub async fn run(&self) -> ! {
        info!(
            jobs = self.jobs.len(),
            tick_ms = self.config.tick.as_millis() as u64,
            "Starting scheduler"
        );
        loop {
            self.run_due().await;
            tokio::time::sleep(self.config.tick).await;
        }
    }
}
