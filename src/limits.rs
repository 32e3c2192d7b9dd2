//! Hard caps. These bound memory per request and per day schedule; none of
//! them are business rules.

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_CREATOR_LEN: usize = 120;

/// One bulk blackout request may cover at most a quarter's worth of dates.
pub const MAX_BULK_DATES: usize = 92;

/// Reservations + blackouts on a single (studio, date) schedule.
pub const MAX_ENTRIES_PER_DAY: usize = 512;

/// Wire protocol line length cap.
pub const MAX_LINE_LEN: usize = 64 * 1024;
