use crate::model::{DaySchedule, Minute, Slot, DAY_END};
use crate::settings::BookingSettings;

// ── Availability Algorithm ────────────────────────────────────────

/// Open sub-intervals of one day's schedule between opening and closing
/// hour, ordered by start.
///
/// Reservations are subtracted with their buffer expansion (what a create
/// would actually be checked against); blackouts are subtracted raw —
/// blackouts never participate in buffer arithmetic.
pub fn free_slots(day: &DaySchedule, settings: &BookingSettings) -> Vec<Slot> {
    let open = hour_to_minute(settings.opening_hour);
    let close = hour_to_minute(settings.closing_hour);
    if open >= close {
        return Vec::new();
    }
    let window = Slot::new(open, close);

    // Probe wider than the window so a reservation just outside it whose
    // buffer reaches inside is still subtracted.
    let probe = window.expanded(settings.buffer_minutes);
    let mut busy: Vec<Slot> = day
        .occupying(probe)
        .map(|r| r.slot.expanded(settings.buffer_minutes))
        .collect();
    busy.extend(day.blackouts_overlapping(window).map(|b| b.slot));
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    subtract_intervals(&[window], &busy)
}

fn hour_to_minute(hour: u32) -> Minute {
    (hour * 60).min(u32::from(DAY_END)) as Minute
}

/// Merge sorted overlapping/adjacent slots into disjoint slots.
pub fn merge_overlapping(sorted: &[Slot]) -> Vec<Slot> {
    let mut merged: Vec<Slot> = Vec::new();
    for &slot in sorted {
        if let Some(last) = merged.last_mut()
            && slot.start <= last.end {
                last.end = last.end.max(slot.end);
                continue;
            }
        merged.push(slot);
    }
    merged
}

/// Subtract `to_remove` (sorted, disjoint) from `base` (sorted, disjoint).
pub fn subtract_intervals(base: &[Slot], to_remove: &[Slot]) -> Vec<Slot> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Slot::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Slot::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Contact, DayKey, Reservation, Studio};
    use ulid::Ulid;

    const H: Minute = 60;

    fn day_with(reservations: Vec<(Minute, Minute, BookingStatus)>, blackouts: Vec<(Minute, Minute)>) -> DaySchedule {
        let key = DayKey {
            studio: Studio::A,
            date: "2025-03-10".parse().unwrap(),
        };
        let at = "2025-03-01"
            .parse::<chrono::NaiveDate>()
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let mut day = DaySchedule::new(key);
        for (start, end, status) in reservations {
            day.insert_reservation(Reservation {
                id: Ulid::new(),
                studio: key.studio,
                date: key.date,
                slot: Slot::new(start, end),
                status,
                contact: Contact {
                    phone: "9876543210".into(),
                    name: None,
                    email: None,
                },
                total: None,
                calendar_event_ref: None,
                confirmation_email_sent: false,
                created_at: at,
                updated_at: at,
                cancelled_at: None,
            });
        }
        for (start, end) in blackouts {
            day.insert_blackout(crate::model::BlackoutSlot {
                id: Ulid::new(),
                studio: key.studio,
                date: key.date,
                slot: Slot::new(start, end),
                is_available: false,
                created_by: "admin".into(),
            });
        }
        day
    }

    fn settings(buffer: Minute) -> BookingSettings {
        BookingSettings {
            buffer_minutes: buffer,
            ..BookingSettings::default()
        }
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Slot::new(100, 200), Slot::new(300, 400)];
        let remove = vec![Slot::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Slot::new(100, 200)];
        let remove = vec![Slot::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Slot::new(100, 300)];
        let remove = vec![Slot::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Slot::new(100, 150), Slot::new(200, 300)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Slot::new(0, 1000)];
        let remove = vec![Slot::new(100, 200), Slot::new(400, 500), Slot::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Slot::new(0, 100),
                Slot::new(200, 400),
                Slot::new(500, 800),
                Slot::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let slots = vec![Slot::new(100, 300), Slot::new(200, 400), Slot::new(500, 600)];
        assert_eq!(
            merge_overlapping(&slots),
            vec![Slot::new(100, 400), Slot::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let slots = vec![Slot::new(100, 200), Slot::new(200, 300)];
        assert_eq!(merge_overlapping(&slots), vec![Slot::new(100, 300)]);
    }

    // ── free_slots ───────────────────────────────────────

    #[test]
    fn free_slots_empty_day_is_whole_window() {
        let day = day_with(vec![], vec![]);
        let free = free_slots(&day, &settings(0));
        assert_eq!(free, vec![Slot::new(9 * H, 21 * H)]);
    }

    #[test]
    fn free_slots_splits_around_booking() {
        let day = day_with(vec![(10 * H, 12 * H, BookingStatus::Confirmed)], vec![]);
        let free = free_slots(&day, &settings(0));
        assert_eq!(free, vec![Slot::new(9 * H, 10 * H), Slot::new(12 * H, 21 * H)]);
    }

    #[test]
    fn free_slots_apply_buffer_to_reservations_only() {
        let day = day_with(
            vec![(10 * H, 12 * H, BookingStatus::Confirmed)],
            vec![(14 * H, 15 * H)],
        );
        let free = free_slots(&day, &settings(15));
        assert_eq!(
            free,
            vec![
                Slot::new(9 * H, 10 * H - 15),
                Slot::new(12 * H + 15, 14 * H), // blackout edge not expanded
                Slot::new(15 * H, 21 * H),
            ]
        );
    }

    #[test]
    fn free_slots_ignore_cancelled() {
        let day = day_with(vec![(10 * H, 12 * H, BookingStatus::Cancelled)], vec![]);
        let free = free_slots(&day, &settings(0));
        assert_eq!(free, vec![Slot::new(9 * H, 21 * H)]);
    }

    #[test]
    fn free_slots_booking_outside_window_with_reaching_buffer() {
        // Reservation ends exactly at opening; its buffer eats into the window.
        let day = day_with(vec![(8 * H, 9 * H, BookingStatus::Confirmed)], vec![]);
        let free = free_slots(&day, &settings(30));
        assert_eq!(free, vec![Slot::new(9 * H + 30, 21 * H)]);
    }

    #[test]
    fn free_slots_fully_blacked_out() {
        let day = day_with(vec![], vec![(0, 1440)]);
        assert!(free_slots(&day, &settings(0)).is_empty());
    }
}
