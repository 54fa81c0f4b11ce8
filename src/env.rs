//! Service environment
//!
//! Everything a service needs from the process (time source, runtime
//! settings) is injected through [`Environment`] at construction time.
//! There are no process-wide singletons.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

use crate::settings::RuntimeSettings;

/// Time source abstraction
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Shared environment passed to every service constructor.
#[derive(Clone)]
pub struct Environment {
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<RuntimeSettings>,
}

impl Environment {
    pub fn new(clock: Arc<dyn Clock>, settings: Arc<RuntimeSettings>) -> Self {
        Self { clock, settings }
    }

    #[inline]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
