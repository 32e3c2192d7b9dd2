use serde::{Deserialize, Serialize};

/// The tunables that parameterize all booking validation, plus the default
/// opening hours used for availability listings.
///
/// A snapshot is passed into every engine call; the engine never caches one.
/// Staleness is tolerated: the no-overlap invariant is enforced by the
/// atomic conflict check regardless of which snapshot admitted a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSettings {
    pub min_duration_hours: u32,
    pub max_duration_hours: u32,
    /// Required gap between consecutive reservations in the same studio.
    pub buffer_minutes: u16,
    /// How many days ahead a reservation may be made.
    pub advance_booking_days: u32,
    pub opening_hour: u32,
    pub closing_hour: u32,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            min_duration_hours: 1,
            max_duration_hours: 8,
            buffer_minutes: 15,
            advance_booking_days: 30,
            opening_hour: 9,
            closing_hour: 21,
        }
    }
}

impl BookingSettings {
    /// Defaults overridden by `ATELIER_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_duration_hours: env_parse("ATELIER_MIN_HOURS", d.min_duration_hours),
            max_duration_hours: env_parse("ATELIER_MAX_HOURS", d.max_duration_hours),
            buffer_minutes: env_parse("ATELIER_BUFFER_MINUTES", d.buffer_minutes),
            advance_booking_days: env_parse("ATELIER_ADVANCE_DAYS", d.advance_booking_days),
            opening_hour: env_parse("ATELIER_OPENING_HOUR", d.opening_hour),
            closing_hour: env_parse("ATELIER_CLOSING_HOUR", d.closing_hour),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.min_duration_hours == 0 {
            return Err("min duration must be at least one hour");
        }
        if self.min_duration_hours > self.max_duration_hours {
            return Err("min duration exceeds max duration");
        }
        if self.advance_booking_days == 0 {
            return Err("advance booking window must be at least one day");
        }
        if self.opening_hour >= self.closing_hour || self.closing_hour > 24 {
            return Err("opening hours out of order");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = BookingSettings::default();
        assert_eq!(s.min_duration_hours, 1);
        assert_eq!(s.max_duration_hours, 8);
        assert_eq!(s.buffer_minutes, 15);
        assert_eq!(s.advance_booking_days, 30);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let mut s = BookingSettings::default();
        s.min_duration_hours = 9;
        assert!(s.validate().is_err());

        let mut s = BookingSettings::default();
        s.opening_hour = 21;
        s.closing_hour = 9;
        assert!(s.validate().is_err());

        let mut s = BookingSettings::default();
        s.closing_hour = 25;
        assert!(s.validate().is_err());
    }
}
