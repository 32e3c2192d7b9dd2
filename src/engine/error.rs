use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::{BookingStatus, Minute, Slot, Studio};

/// Caller-visible category of a failure, deciding whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller-correctable input problem; detected before any mutation.
    Validation,
    /// The requested slot/row is taken; retry with different parameters.
    Conflict,
    /// Authorization or lifecycle state; no retry is meaningful.
    State,
    /// Store/log trouble; safe to retry, no partial writes survive.
    Infrastructure,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidPhone,
    MissingFields(&'static str),
    DurationOutOfRange {
        minutes: Minute,
        min_hours: u32,
        max_hours: u32,
    },
    DateOutOfWindow {
        date: NaiveDate,
        earliest: NaiveDate,
        latest: NaiveDate,
    },
    SlotUnavailable {
        studio: Studio,
        date: NaiveDate,
        slot: Slot,
    },
    NotFoundOrForbidden(Ulid),
    ImmutableStatus(BookingStatus),
    ModificationWindowClosed {
        starts_at: NaiveDateTime,
    },
    BookingAlreadyElapsed {
        starts_at: NaiveDateTime,
    },
    DuplicateBlackout {
        studio: Studio,
        date: NaiveDate,
        slot: Slot,
    },
    AllDatesInPast,
    AllSlotsConflicted,
    NotFound(Ulid),
    NoBlackoutsInRange,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable snake_case identifier used on the wire and in metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidPhone => "invalid_phone",
            EngineError::MissingFields(_) => "missing_fields",
            EngineError::DurationOutOfRange { .. } => "duration_out_of_range",
            EngineError::DateOutOfWindow { .. } => "date_out_of_window",
            EngineError::SlotUnavailable { .. } => "slot_unavailable",
            EngineError::NotFoundOrForbidden(_) => "not_found_or_forbidden",
            EngineError::ImmutableStatus(_) => "immutable_status",
            EngineError::ModificationWindowClosed { .. } => "modification_window_closed",
            EngineError::BookingAlreadyElapsed { .. } => "booking_already_elapsed",
            EngineError::DuplicateBlackout { .. } => "duplicate_blackout",
            EngineError::AllDatesInPast => "all_dates_in_past",
            EngineError::AllSlotsConflicted => "all_slots_conflicted",
            EngineError::NotFound(_) | EngineError::NoBlackoutsInRange => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::InvalidPhone
            | EngineError::MissingFields(_)
            | EngineError::DurationOutOfRange { .. }
            | EngineError::DateOutOfWindow { .. }
            | EngineError::LimitExceeded(_) => ErrorCategory::Validation,
            EngineError::SlotUnavailable { .. }
            | EngineError::DuplicateBlackout { .. }
            | EngineError::AllDatesInPast
            | EngineError::AllSlotsConflicted => ErrorCategory::Conflict,
            EngineError::NotFoundOrForbidden(_)
            | EngineError::ImmutableStatus(_)
            | EngineError::ModificationWindowClosed { .. }
            | EngineError::BookingAlreadyElapsed { .. }
            | EngineError::NotFound(_)
            | EngineError::NoBlackoutsInRange => ErrorCategory::State,
            EngineError::WalError(_) => ErrorCategory::Infrastructure,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidPhone => {
                write!(f, "phone must normalize to exactly 10 digits")
            }
            EngineError::MissingFields(what) => write!(f, "invalid request: {what}"),
            EngineError::DurationOutOfRange {
                minutes,
                min_hours,
                max_hours,
            } => {
                if u32::from(*minutes) < min_hours * 60 {
                    write!(f, "duration {minutes}min is below the {min_hours}h minimum")
                } else {
                    write!(f, "duration {minutes}min is above the {max_hours}h maximum")
                }
            }
            EngineError::DateOutOfWindow {
                date,
                earliest,
                latest,
            } => write!(f, "date {date} outside bookable window [{earliest}, {latest}]"),
            EngineError::SlotUnavailable { studio, date, slot } => {
                write!(f, "studio {studio} is not available on {date} at {slot}")
            }
            EngineError::NotFoundOrForbidden(id) => {
                write!(f, "no reservation {id} for this phone number")
            }
            EngineError::ImmutableStatus(status) => {
                write!(f, "reservation status {status} cannot change this way")
            }
            EngineError::ModificationWindowClosed { starts_at } => {
                write!(f, "reservation starting {starts_at} is within 24h; changes closed")
            }
            EngineError::BookingAlreadyElapsed { starts_at } => {
                write!(f, "reservation starting {starts_at} has already elapsed")
            }
            EngineError::DuplicateBlackout { studio, date, slot } => {
                write!(f, "blackout already exists for studio {studio} on {date} at {slot}")
            }
            EngineError::AllDatesInPast => {
                write!(f, "every requested date is in the past")
            }
            EngineError::AllSlotsConflicted => {
                write!(f, "every surviving date has a confirmed reservation in that slot")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NoBlackoutsInRange => write!(f, "no blackouts match the range"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
