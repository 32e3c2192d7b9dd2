use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;
use crate::settings::BookingSettings;

use super::availability::free_slots;
use super::Engine;

impl Engine {
    /// Ordered open sub-intervals between opening and closing hour, minus
    /// reservations (buffer-expanded) and blackouts (raw). Read lock only.
    pub async fn list_availability(
        &self,
        studio: Studio,
        date: NaiveDate,
        settings: &BookingSettings,
    ) -> Vec<Slot> {
        let key = DayKey { studio, date };
        match self.peek_day(&key) {
            Some(day) => {
                let guard = day.read().await;
                free_slots(&guard, settings)
            }
            None => free_slots(&DaySchedule::new(key), settings),
        }
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let key = self.day_of_reservation(&id)?;
        let day = self.peek_day(&key)?;
        let guard = day.read().await;
        guard.reservation(id).cloned()
    }

    /// All reservations on one day, in slot order, history included.
    pub async fn list_reservations(&self, studio: Studio, date: NaiveDate) -> Vec<Reservation> {
        let key = DayKey { studio, date };
        match self.peek_day(&key) {
            Some(day) => {
                let guard = day.read().await;
                guard.reservations.clone()
            }
            None => Vec::new(),
        }
    }

    pub async fn list_blackouts(&self, studio: Studio, date: NaiveDate) -> Vec<BlackoutSlot> {
        let key = DayKey { studio, date };
        match self.peek_day(&key) {
            Some(day) => {
                let guard = day.read().await;
                guard.blackouts.clone()
            }
            None => Vec::new(),
        }
    }

    /// Every reminder record ever derived for a reservation, in creation
    /// order.
    pub fn reminders_for(&self, reservation_id: Ulid) -> Vec<ReminderRecord> {
        self.reminders
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Pending reminders whose fire time has passed. The pump hands these to
    /// the dispatcher; whether a long-overdue one still fires is dispatcher
    /// policy.
    pub fn collect_due_reminders(&self, now: NaiveDateTime) -> Vec<ReminderRecord> {
        let mut due = Vec::new();
        for entry in self.reminders.iter() {
            for record in entry.value() {
                if record.status == ReminderStatus::Pending && record.fire_at <= now {
                    due.push(record.clone());
                }
            }
        }
        due
    }
}
