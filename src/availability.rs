//! Slot availability
//!
//! Pure functions over the runtime booking settings, a service duration
//! and the bookings occupying a day. Nothing here touches storage.
//!
//! The working window of a business day is cut into candidate slots of
//! `duration + buffer` minutes starting at `working_hours_start`. A slot is
//! offered when it fits before `working_hours_end`, starts no earlier than
//! `now + buffer`, and overlaps no blocking booking.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use crate::booking::BookingState;
use crate::error::{CoreError, CoreResult};
use crate::settings::BookingSettings;

/// A booking's claim on the calendar
#[derive(Debug, Clone, PartialEq)]
pub struct Occupancy {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: BookingState,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

impl Occupancy {
    /// Lapsed holds stop blocking immediately, before the expiry sweep
    /// moves them out of `held`.
    pub fn blocks(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            BookingState::Held => self.hold_expires_at.is_none_or(|t| t > now),
            s => s.occupies_calendar(),
        }
    }

    fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }
}

/// Offered slot, `[start, end)` with `end = start + duration`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn business_offset(settings: &BookingSettings) -> CoreResult<FixedOffset> {
    FixedOffset::east_opt(settings.business_utc_offset_minutes * 60).ok_or_else(|| {
        CoreError::internal(format!(
            "invalid business offset {} minutes",
            settings.business_utc_offset_minutes
        ))
    })
}

/// Business-local calendar date of `at`
pub fn business_date(settings: &BookingSettings, at: DateTime<Utc>) -> CoreResult<NaiveDate> {
    Ok(at.with_timezone(&business_offset(settings)?).date_naive())
}

fn local_instant(offset: FixedOffset, date: NaiveDate, time: NaiveTime) -> CoreResult<DateTime<Utc>> {
    date.and_time(time)
        .and_local_timezone(offset)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| CoreError::internal(format!("unrepresentable local time {} {}", date, time)))
}

/// Working window of `date` as UTC instants
pub fn working_window(
    settings: &BookingSettings,
    date: NaiveDate,
) -> CoreResult<(DateTime<Utc>, DateTime<Utc>)> {
    let offset = business_offset(settings)?;
    Ok((
        local_instant(offset, date, settings.working_hours_start)?,
        local_instant(offset, date, settings.working_hours_end)?,
    ))
}

/// `date` must fall within `[today, today + booking_advance_days]`.
pub fn check_bookable_date(
    settings: &BookingSettings,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let today = business_date(settings, now)?;
    let last = today + Duration::days(settings.booking_advance_days);
    if date < today {
        return Err(CoreError::validation(format!("{} is in the past", date)));
    }
    if date > last {
        return Err(CoreError::validation(format!(
            "{} is more than {} days ahead",
            date, settings.booking_advance_days
        )));
    }
    Ok(())
}

/// Free slots of `duration_minutes` on `date`, ascending by start.
pub fn free_slots(
    settings: &BookingSettings,
    duration_minutes: i64,
    date: NaiveDate,
    occupied: &[Occupancy],
    now: DateTime<Utc>,
) -> CoreResult<Vec<Slot>> {
    if duration_minutes <= 0 {
        return Err(CoreError::validation("service duration must be positive"));
    }
    check_bookable_date(settings, date, now)?;

    let (open, close) = working_window(settings, date)?;
    let duration = Duration::minutes(duration_minutes);
    let step = duration + Duration::minutes(settings.booking_buffer_time_minutes);
    let earliest = now + Duration::minutes(settings.booking_buffer_time_minutes);
    let blocking: Vec<&Occupancy> = occupied.iter().filter(|o| o.blocks(now)).collect();

    let mut slots = Vec::new();
    let mut start = open;
    while start + duration <= close {
        let end = start + duration;
        if start >= earliest && !blocking.iter().any(|o| o.overlaps(start, end)) {
            slots.push(Slot { start, end });
        }
        start += step;
    }
    Ok(slots)
}

/// The free slot starting at `start`, if any.
pub fn find_slot(
    settings: &BookingSettings,
    duration_minutes: i64,
    start: DateTime<Utc>,
    occupied: &[Occupancy],
    now: DateTime<Utc>,
) -> CoreResult<Slot> {
    let date = business_date(settings, start)?;
    free_slots(settings, duration_minutes, date, occupied, now)?
        .into_iter()
        .find(|s| s.start == start)
        .ok_or_else(|| CoreError::conflict(format!("slot {} is not available", start)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 09:15 IST
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 3, 45, 0).unwrap()
    }

    fn ist(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2025, 6, d, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn occupied(start: DateTime<Utc>, state: BookingState) -> Occupancy {
        Occupancy {
            start,
            end: start + Duration::minutes(60),
            state,
            hold_expires_at: None,
        }
    }

    #[test]
    fn test_grid_aligned_to_working_start() {
        let s = BookingSettings::default();
        let slots = free_slots(&s, 60, day(3), &[], now()).unwrap();
        // 09:00, 10:15, ... 16:30; 17:45 would end after 18:00
        assert_eq!(slots.len(), 7);
        assert_eq!(slots[0].start, ist(3, 9, 0));
        assert_eq!(slots[1].start, ist(3, 10, 15));
        assert_eq!(slots[6].end, ist(3, 17, 30));
        assert!(slots.windows(2).all(|w| w[0].start < w[1].start));
    }

    #[test]
    fn test_today_skips_slots_inside_buffer() {
        let s = BookingSettings::default();
        let slots = free_slots(&s, 60, day(2), &[], now()).unwrap();
        assert_eq!(slots[0].start, ist(2, 10, 15));
        assert_eq!(slots.len(), 6);
    }

    #[test]
    fn test_active_bookings_block_and_lapsed_holds_do_not() {
        let s = BookingSettings::default();
        let mut lapsed = occupied(ist(3, 11, 30), BookingState::Held);
        lapsed.hold_expires_at = Some(now() - Duration::minutes(1));
        let mut live = occupied(ist(3, 12, 45), BookingState::Held);
        live.hold_expires_at = Some(now() + Duration::minutes(5));
        let taken = vec![
            occupied(ist(3, 9, 0), BookingState::Confirmed),
            occupied(ist(3, 10, 15), BookingState::Cancelled),
            lapsed,
            live,
            occupied(ist(3, 14, 0), BookingState::Completed),
        ];
        let starts: Vec<_> = free_slots(&s, 60, day(3), &taken, now())
            .unwrap()
            .into_iter()
            .map(|s| s.start)
            .collect();
        assert_eq!(
            starts,
            vec![ist(3, 10, 15), ist(3, 11, 30), ist(3, 15, 15), ist(3, 16, 30)]
        );
    }

    #[test]
    fn test_booking_horizon() {
        let s = BookingSettings::default();
        assert!(free_slots(&s, 60, day(1), &[], now()).is_err());
        assert!(free_slots(&s, 60, day(9), &[], now()).is_ok());
        assert!(free_slots(&s, 60, day(10), &[], now()).is_err());
    }

    #[test]
    fn test_find_slot_rejects_off_grid() {
        let s = BookingSettings::default();
        assert!(find_slot(&s, 60, ist(3, 10, 15), &[], now()).is_ok());
        let err = find_slot(&s, 60, ist(3, 10, 0), &[], now()).unwrap_err();
        assert!(matches!(err, CoreError::ConflictingTransition(_)));
    }

    #[test]
    fn test_long_service_fits_fewer_slots() {
        let s = BookingSettings::default();
        // 240 + 15 step: 09:00, 13:15; 17:30 would end after 18:00
        assert_eq!(free_slots(&s, 240, day(3), &[], now()).unwrap().len(), 2);
        assert!(free_slots(&s, 0, day(3), &[], now()).is_err());
    }
}
