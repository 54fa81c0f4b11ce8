//! Runtime-tunable settings
//!
//! Operators tune booking policy through `system_settings_tb` (key/value).
//! [`RuntimeSettings`] exposes a typed, cached snapshot built on top of
//! defaults. A bad value never takes the service down: the previous value
//! is kept and the error is logged.

use async_trait::async_trait;
use chrono::NaiveTime;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::CoreResult;

/// Raw key/value source of runtime settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_settings(&self) -> CoreResult<Vec<(String, String)>>;
}

/// Reads `system_settings_tb`.
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn load_settings(&self) -> CoreResult<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM system_settings_tb ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Typed snapshot of every runtime-tunable key.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingSettings {
    pub working_hours_start: NaiveTime,
    pub working_hours_end: NaiveTime,
    pub booking_advance_days: i64,
    pub booking_buffer_time_minutes: i64,
    pub booking_hold_time_minutes: i64,
    pub quote_ttl_hours: i64,
    pub push_retry_max: u32,
    /// Customer cancellations later than this many minutes before the
    /// scheduled start only get `refund_late_fraction` back.
    pub refund_policy_cutoff_minutes: i64,
    pub refund_late_fraction: Decimal,
    pub inquiry_booking_fee: Decimal,
    /// Offset of the business day (working hours) from UTC. IST = +330.
    pub business_utc_offset_minutes: i32,
    pub withdrawal_reminder_age_hours: i64,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            working_hours_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            working_hours_end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
            booking_advance_days: 7,
            booking_buffer_time_minutes: 15,
            booking_hold_time_minutes: 7,
            quote_ttl_hours: 48,
            push_retry_max: 5,
            refund_policy_cutoff_minutes: 120,
            refund_late_fraction: Decimal::new(5, 1),
            inquiry_booking_fee: Decimal::new(100, 0),
            business_utc_offset_minutes: 330,
            withdrawal_reminder_age_hours: 24,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value for {}: {:?}", key, value))
}

fn parse_time(key: &str, value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value.trim(), "%H:%M:%S"))
        .map_err(|_| format!("invalid time for {}: {:?}", key, value))
}

impl BookingSettings {
    /// Apply one key/value pair. Unknown keys are ignored (they belong to
    /// other collaborators sharing the settings table).
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "working_hours_start" => self.working_hours_start = parse_time(key, value)?,
            "working_hours_end" => self.working_hours_end = parse_time(key, value)?,
            "booking_advance_days" => self.booking_advance_days = parse(key, value)?,
            "booking_buffer_time_minutes" => self.booking_buffer_time_minutes = parse(key, value)?,
            "booking_hold_time_minutes" => self.booking_hold_time_minutes = parse(key, value)?,
            "quote_ttl_hours" => self.quote_ttl_hours = parse(key, value)?,
            "push_retry_max" => self.push_retry_max = parse(key, value)?,
            "refund_policy_cutoff_minutes" => {
                self.refund_policy_cutoff_minutes = parse(key, value)?
            }
            "refund_late_fraction" => self.refund_late_fraction = parse(key, value)?,
            "inquiry_booking_fee" => self.inquiry_booking_fee = parse(key, value)?,
            "business_utc_offset_minutes" => {
                self.business_utc_offset_minutes = parse(key, value)?
            }
            "withdrawal_reminder_age_hours" => {
                self.withdrawal_reminder_age_hours = parse(key, value)?
            }
            _ => {}
        }
        Ok(())
    }

    /// Cross-field checks run after all keys are applied.
    pub fn validate(&self) -> Result<(), String> {
        if self.working_hours_end <= self.working_hours_start {
            return Err("working_hours_end must be after working_hours_start".into());
        }
        if self.booking_hold_time_minutes <= 0 {
            return Err("booking_hold_time_minutes must be positive".into());
        }
        if self.booking_buffer_time_minutes < 0 || self.booking_advance_days < 0 {
            return Err("buffer and advance days must not be negative".into());
        }
        if self.refund_late_fraction < Decimal::ZERO || self.refund_late_fraction > Decimal::ONE {
            return Err("refund_late_fraction must be within [0, 1]".into());
        }
        Ok(())
    }

    /// Build from key/value rows on top of `base`. Bad keys keep the base
    /// value and are reported back.
    pub fn from_pairs(base: &BookingSettings, pairs: &[(String, String)]) -> (Self, Vec<String>) {
        let mut next = base.clone();
        let mut errors = Vec::new();
        for (key, value) in pairs {
            if let Err(e) = next.apply(key, value) {
                errors.push(e);
            }
        }
        if let Err(e) = next.validate() {
            errors.push(e);
            return (base.clone(), errors);
        }
        (next, errors)
    }
}

struct Cached {
    value: BookingSettings,
    loaded_at: Option<Instant>,
}

/// Cached, typed accessor over the settings store.
pub struct RuntimeSettings {
    store: Option<Arc<dyn SettingsStore>>,
    cache: RwLock<Cached>,
    ttl: Duration,
}

impl RuntimeSettings {
    pub fn new(store: Arc<dyn SettingsStore>, ttl: Duration) -> Self {
        Self {
            store: Some(store),
            cache: RwLock::new(Cached {
                value: BookingSettings::default(),
                loaded_at: None,
            }),
            ttl,
        }
    }

    /// Settings that never reload (tests, tooling).
    pub fn fixed(value: BookingSettings) -> Self {
        Self {
            store: None,
            cache: RwLock::new(Cached {
                value,
                loaded_at: None,
            }),
            ttl: Duration::MAX,
        }
    }

    /// Current snapshot, reloading from the store when the cache is stale.
    pub async fn booking(&self) -> BookingSettings {
        let stale = {
            let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
            match cache.loaded_at {
                Some(at) => at.elapsed() >= self.ttl,
                None => self.store.is_some(),
            }
        };
        if stale {
            self.reload().await;
        }
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .value
            .clone()
    }

    /// Force a reload. Errors keep the old snapshot.
    pub async fn reload(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let base = self
            .cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .value
            .clone();

        let next = match store.load_settings().await {
            Ok(pairs) => {
                let (next, errors) = BookingSettings::from_pairs(&base, &pairs);
                for e in errors {
                    tracing::error!(target: "CONFIG", "Invalid runtime setting: {}, keeping old value", e);
                }
                next
            }
            Err(e) => {
                tracing::error!(target: "CONFIG", error = %e, "Failed to load runtime settings, keeping old configuration");
                base
            }
        };

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        cache.value = next;
        cache.loaded_at = Some(Instant::now());
    }
}
