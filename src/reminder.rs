//! Reminder derivation. Purely a function of (reservation id, start time);
//! delivery and past-due policy belong to the dispatcher.

use chrono::{Duration, NaiveDateTime};
use ulid::Ulid;

use crate::model::{ReminderKind, ReminderRecord, ReminderStatus};

/// The batch created with a new reservation: an immediate confirmation
/// (already sent) plus the 24h and 1h lead-time reminders. Lead times in
/// the past are kept as-is with their past `fire_at`.
pub fn initial_batch(
    reservation_id: Ulid,
    starts_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Vec<ReminderRecord> {
    let mut batch = vec![ReminderRecord {
        reservation_id,
        kind: ReminderKind::Confirmation,
        fire_at: now,
        status: ReminderStatus::Sent,
    }];
    batch.extend(reschedule_pair(reservation_id, starts_at));
    batch
}

/// The pair recreated after a time change. The confirmation record is never
/// recreated.
pub fn reschedule_pair(reservation_id: Ulid, starts_at: NaiveDateTime) -> Vec<ReminderRecord> {
    vec![
        ReminderRecord {
            reservation_id,
            kind: ReminderKind::DayBefore,
            fire_at: starts_at - Duration::hours(24),
            status: ReminderStatus::Pending,
        },
        ReminderRecord {
            reservation_id,
            kind: ReminderKind::HourBefore,
            fire_at: starts_at - Duration::hours(1),
            status: ReminderStatus::Pending,
        },
    ]
}
