use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use ulid::Ulid;

use crate::model::{DaySchedule, Minute, Slot, DAY_END};
use crate::settings::BookingSettings;

use super::EngineError;

/// A reservation may only change while its current start is at least this
/// far away.
pub const MODIFY_CUTOFF_HOURS: i64 = 24;

/// Facility wall-clock "now" for a fixed UTC offset (no DST).
pub fn local_now(utc_offset_minutes: i32) -> NaiveDateTime {
    Utc::now().naive_utc() + Duration::minutes(i64::from(utc_offset_minutes))
}

/// Strip everything but ASCII digits.
pub fn digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn normalize_phone(raw: &str) -> Result<String, EngineError> {
    let d = digits(raw);
    if d.len() != 10 {
        return Err(EngineError::InvalidPhone);
    }
    Ok(d)
}

pub(super) fn check_slot(start: Minute, end: Minute) -> Result<Slot, EngineError> {
    if end > DAY_END {
        return Err(EngineError::MissingFields("end time past midnight"));
    }
    if start >= end {
        return Err(EngineError::MissingFields("end must be after start"));
    }
    Ok(Slot::new(start, end))
}

pub(super) fn check_duration(slot: &Slot, settings: &BookingSettings) -> Result<(), EngineError> {
    let minutes = slot.duration_minutes();
    if u32::from(minutes) < settings.min_duration_hours * 60
        || u32::from(minutes) > settings.max_duration_hours * 60
    {
        return Err(EngineError::DurationOutOfRange {
            minutes,
            min_hours: settings.min_duration_hours,
            max_hours: settings.max_duration_hours,
        });
    }
    Ok(())
}

/// Same-day booking is rejected on the customer path; the latest bookable
/// date is `today + advance_booking_days`.
pub(super) fn check_booking_window(
    date: NaiveDate,
    today: NaiveDate,
    settings: &BookingSettings,
) -> Result<(), EngineError> {
    let earliest = today + Duration::days(1);
    let latest = today + Duration::days(i64::from(settings.advance_booking_days));
    if date < earliest || date > latest {
        return Err(EngineError::DateOutOfWindow {
            date,
            earliest,
            latest,
        });
    }
    Ok(())
}

/// The atomic-section conflict check. The *requested* slot is expanded by
/// the buffer and probed against raw stored reservations; blackouts are
/// probed with the raw requested slot — blackouts are never buffer-expanded.
pub(super) fn check_slot_free(
    day: &DaySchedule,
    slot: &Slot,
    buffer_minutes: u16,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let probe = slot.expanded(buffer_minutes);
    let unavailable = EngineError::SlotUnavailable {
        studio: day.key.studio,
        date: day.key.date,
        slot: *slot,
    };
    if day.occupying(probe).any(|r| exclude != Some(r.id)) {
        return Err(unavailable);
    }
    if day.blackouts_overlapping(*slot).next().is_some() {
        return Err(unavailable);
    }
    Ok(())
}

pub(super) fn derived_total(rate_per_hour: Option<f64>, slot: &Slot) -> Option<i64> {
    rate_per_hour.map(|rate| (rate * f64::from(slot.duration_minutes()) / 60.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("9876543210").unwrap(), "9876543210");
        assert_eq!(normalize_phone("98765 43210").unwrap(), "9876543210");
        assert_eq!(normalize_phone("(987) 654-3210").unwrap(), "9876543210");
        assert!(matches!(
            normalize_phone("987654321"),
            Err(EngineError::InvalidPhone)
        ));
        assert!(matches!(
            normalize_phone("+91 98765 43210"), // 12 digits
            Err(EngineError::InvalidPhone)
        ));
        assert!(matches!(normalize_phone(""), Err(EngineError::InvalidPhone)));
    }

    #[test]
    fn slot_validation() {
        assert_eq!(check_slot(600, 720).unwrap(), Slot::new(600, 720));
        assert!(matches!(
            check_slot(720, 720),
            Err(EngineError::MissingFields(_))
        ));
        assert!(matches!(
            check_slot(720, 600),
            Err(EngineError::MissingFields(_))
        ));
        assert!(matches!(
            check_slot(600, 1441),
            Err(EngineError::MissingFields(_))
        ));
    }

    #[test]
    fn duration_bounds_report_violated_side() {
        let settings = BookingSettings::default(); // 1h..8h
        assert!(check_duration(&Slot::new(600, 720), &settings).is_ok());
        assert!(check_duration(&Slot::new(600, 660), &settings).is_ok()); // exactly min
        assert!(check_duration(&Slot::new(600, 1080), &settings).is_ok()); // exactly max

        let short = check_duration(&Slot::new(600, 630), &settings).unwrap_err();
        assert!(short.to_string().contains("below"));
        let long = check_duration(&Slot::new(540, 1140), &settings).unwrap_err();
        assert!(long.to_string().contains("above"));
    }

    #[test]
    fn booking_window_bounds() {
        let settings = BookingSettings::default(); // 30 days
        let today: NaiveDate = "2025-03-01".parse().unwrap();

        // Same-day rejected, tomorrow is the first bookable date.
        assert!(check_booking_window("2025-03-01".parse().unwrap(), today, &settings).is_err());
        assert!(check_booking_window("2025-03-02".parse().unwrap(), today, &settings).is_ok());
        // Last day inside the horizon, then one past it.
        assert!(check_booking_window("2025-03-31".parse().unwrap(), today, &settings).is_ok());
        assert!(check_booking_window("2025-04-01".parse().unwrap(), today, &settings).is_err());
        // Yesterday.
        assert!(check_booking_window("2025-02-28".parse().unwrap(), today, &settings).is_err());
    }

    #[test]
    fn total_rounds_rate_times_hours() {
        assert_eq!(derived_total(Some(1500.0), &Slot::new(600, 720)), Some(3000));
        assert_eq!(derived_total(Some(1500.0), &Slot::new(600, 690)), Some(2250));
        assert_eq!(derived_total(Some(999.5), &Slot::new(600, 660)), Some(1000));
        assert_eq!(derived_total(None, &Slot::new(600, 720)), None);
    }
}
