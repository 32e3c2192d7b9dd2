use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::PostCommit;
use crate::reminder;
use crate::settings::BookingSettings;

use super::validate::{
    check_booking_window, check_duration, check_slot, check_slot_free, derived_total, digits,
    normalize_phone, MODIFY_CUTOFF_HOURS,
};
use super::{Engine, EngineError};

impl Engine {
    /// Customer-facing create. Validation order (each a distinct failure):
    /// phone, fields, duration, booking window, then the atomic conflict
    /// check under this day's write lock.
    pub async fn create_reservation(
        &self,
        req: ReservationRequest,
        settings: &BookingSettings,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let phone = normalize_phone(&req.phone)?;
        let slot = check_slot(req.start, req.end)?;
        check_contact_limits(&req.name, &req.email)?;
        check_duration(&slot, settings)?;
        check_booking_window(req.date, now.date(), settings)?;

        let key = DayKey {
            studio: req.studio,
            date: req.date,
        };
        let day = self.day(key);
        let mut guard = day.write_owned().await;
        if guard.entry_count() >= MAX_ENTRIES_PER_DAY {
            return Err(EngineError::LimitExceeded("day schedule full"));
        }
        if let Err(e) = check_slot_free(&guard, &slot, settings.buffer_minutes, None) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let reservation = Reservation {
            id: Ulid::new(),
            studio: req.studio,
            date: req.date,
            slot,
            status: BookingStatus::Confirmed,
            contact: Contact {
                phone,
                name: req.name,
                email: req.email,
            },
            total: derived_total(req.rate_per_hour, &slot),
            calendar_event_ref: None,
            confirmation_email_sent: false,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        };
        let batch = reminder::initial_batch(reservation.id, reservation.starts_at(), now);

        let events = [
            Event::ReservationBooked {
                reservation: reservation.clone(),
            },
            Event::RemindersScheduled {
                reservation_id: reservation.id,
                batch: batch.clone(),
            },
        ];
        self.commit(&events).await?;
        self.apply_booked(&mut guard, &reservation);
        self.apply_reminder_event(&events[1]);
        drop(guard);

        metrics::counter!(crate::observability::RESERVATIONS_BOOKED_TOTAL).increment(1);
        self.publish(PostCommit::Booked {
            reservation: reservation.clone(),
            reminders: batch,
        });
        Ok(reservation)
    }

    /// Ownership, lifecycle, and the 24h window are all re-checked inside the
    /// atomic section so a concurrent cancel/modify can't slip between the
    /// precondition check and the write.
    pub async fn modify_reservation(
        &self,
        req: ModifyRequest,
        settings: &BookingSettings,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let slot = check_slot(req.start, req.end)?;
        check_contact_limits(&req.name, &req.email)?;

        let old_key = self
            .day_of_reservation(&req.reservation_id)
            .ok_or(EngineError::NotFoundOrForbidden(req.reservation_id))?;
        let new_key = DayKey {
            studio: req.studio,
            date: req.date,
        };

        // Both day locks, always in key order, so concurrent cross-day
        // modifications cannot deadlock.
        let (mut old_guard, mut new_guard) = if old_key == new_key {
            (self.day(old_key).write_owned().await, None)
        } else if old_key < new_key {
            let old = self.day(old_key).write_owned().await;
            let new = self.day(new_key).write_owned().await;
            (old, Some(new))
        } else {
            let new = self.day(new_key).write_owned().await;
            let old = self.day(old_key).write_owned().await;
            (old, Some(new))
        };

        let current = old_guard
            .reservation(req.reservation_id)
            .ok_or(EngineError::NotFoundOrForbidden(req.reservation_id))?
            .clone();
        if current.contact.phone != digits(&req.phone) {
            return Err(EngineError::NotFoundOrForbidden(req.reservation_id));
        }
        if matches!(
            current.status,
            BookingStatus::Cancelled | BookingStatus::Completed
        ) {
            return Err(EngineError::ImmutableStatus(current.status));
        }
        // The guard uses the booking's existing start, not the proposed one.
        let starts_at = current.starts_at();
        if starts_at.signed_duration_since(now) < Duration::hours(MODIFY_CUTOFF_HOURS) {
            return Err(EngineError::ModificationWindowClosed { starts_at });
        }

        // The new interval re-runs the full create-side validation.
        check_duration(&slot, settings)?;
        check_booking_window(req.date, now.date(), settings)?;

        let target = new_guard.as_deref().unwrap_or(&old_guard);
        if new_guard.is_some() && target.entry_count() >= MAX_ENTRIES_PER_DAY {
            return Err(EngineError::LimitExceeded("day schedule full"));
        }
        if let Err(e) = check_slot_free(
            target,
            &slot,
            settings.buffer_minutes,
            Some(req.reservation_id),
        ) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let mut updated = current;
        updated.studio = req.studio;
        updated.date = req.date;
        updated.slot = slot;
        if req.name.is_some() {
            updated.contact.name = req.name;
        }
        if req.email.is_some() {
            updated.contact.email = req.email;
        }
        if req.rate_per_hour.is_some() {
            updated.total = derived_total(req.rate_per_hour, &slot);
        }
        updated.updated_at = now;

        let events = [
            Event::ReservationModified {
                reservation: updated.clone(),
            },
            Event::RemindersCancelled {
                reservation_id: updated.id,
            },
            Event::RemindersScheduled {
                reservation_id: updated.id,
                batch: reminder::reschedule_pair(updated.id, updated.starts_at()),
            },
        ];
        self.commit(&events).await?;
        match new_guard.as_mut() {
            Some(new) => self.apply_moved(&mut old_guard, new, &updated),
            None => self.apply_rebooked(&mut old_guard, &updated),
        }
        self.apply_reminder_event(&events[1]);
        self.apply_reminder_event(&events[2]);
        drop(new_guard);
        drop(old_guard);

        self.publish(PostCommit::Modified {
            reservation: updated.clone(),
        });
        Ok(updated)
    }

    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        requester: Requester,
        reason: Option<String>,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let key = self
            .day_of_reservation(&id)
            .ok_or(EngineError::NotFoundOrForbidden(id))?;
        let day = self.day(key);
        let mut guard = day.write_owned().await;

        let current = guard
            .reservation(id)
            .ok_or(EngineError::NotFoundOrForbidden(id))?
            .clone();
        if let Requester::Customer { phone } = &requester
            && current.contact.phone != digits(phone)
        {
            return Err(EngineError::NotFoundOrForbidden(id));
        }
        if !current.status.occupies() {
            return Err(EngineError::ImmutableStatus(current.status));
        }
        let starts_at = current.starts_at();
        if now >= starts_at {
            return Err(EngineError::BookingAlreadyElapsed { starts_at });
        }

        let events = [
            Event::ReservationStatusChanged {
                id,
                status: BookingStatus::Cancelled,
                at: now,
                reason: reason.clone(),
            },
            Event::RemindersCancelled {
                reservation_id: id,
            },
        ];
        self.commit(&events).await?;
        Self::apply_status_changed(&mut guard, id, BookingStatus::Cancelled, now);
        self.apply_reminder_event(&events[1]);
        let cancelled = guard
            .reservation(id)
            .cloned()
            .expect("reservation still present after status change");
        drop(guard);

        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        self.publish(PostCommit::Cancelled {
            reservation: cancelled.clone(),
            reason,
        });
        Ok(cancelled)
    }

    /// Staff path: mark a confirmed reservation completed or no-show. Both
    /// end the reservation's occupancy, so this runs in the same exclusive
    /// section as create/cancel.
    pub async fn set_reservation_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        if !matches!(status, BookingStatus::Completed | BookingStatus::NoShow) {
            return Err(EngineError::ImmutableStatus(status));
        }
        let key = self
            .day_of_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let day = self.day(key);
        let mut guard = day.write_owned().await;

        let current = guard
            .reservation(id)
            .ok_or(EngineError::NotFound(id))?
            .clone();
        if current.status != BookingStatus::Confirmed {
            return Err(EngineError::ImmutableStatus(current.status));
        }

        let events = [
            Event::ReservationStatusChanged {
                id,
                status,
                at: now,
                reason: None,
            },
            Event::RemindersCancelled {
                reservation_id: id,
            },
        ];
        self.commit(&events).await?;
        Self::apply_status_changed(&mut guard, id, status, now);
        self.apply_reminder_event(&events[1]);
        let updated = guard
            .reservation(id)
            .cloned()
            .expect("reservation still present after status change");
        drop(guard);

        self.publish(PostCommit::StatusChanged {
            reservation: updated.clone(),
        });
        Ok(updated)
    }

    /// Persist linkage reported back by the Notification Dispatcher after its
    /// fire-and-forget work succeeded. Never part of a booking transaction.
    pub async fn record_external_refs(
        &self,
        id: Ulid,
        calendar_event_ref: Option<String>,
        email_sent: bool,
    ) -> Result<(), EngineError> {
        let key = self
            .day_of_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let day = self.day(key);
        let mut guard = day.write_owned().await;
        if guard.reservation(id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::ExternalRefsRecorded {
            id,
            calendar_event_ref: calendar_event_ref.clone(),
            email_sent,
        };
        self.commit(std::slice::from_ref(&event)).await?;
        Self::apply_external_refs(&mut guard, id, &calendar_event_ref, email_sent);
        Ok(())
    }

    // ── Blackouts ────────────────────────────────────────

    pub async fn create_blackout(
        &self,
        studio: Studio,
        date: NaiveDate,
        start: Minute,
        end: Minute,
        created_by: String,
    ) -> Result<BlackoutSlot, EngineError> {
        let slot = check_slot(start, end)?;
        if created_by.len() > MAX_CREATOR_LEN {
            return Err(EngineError::LimitExceeded("creator reference too long"));
        }
        let key = DayKey { studio, date };
        let day = self.day(key);
        let mut guard = day.write_owned().await;
        if guard.entry_count() >= MAX_ENTRIES_PER_DAY {
            return Err(EngineError::LimitExceeded("day schedule full"));
        }
        // Uniqueness of (studio, date, start, end): reject, never merge.
        if guard.blackouts.iter().any(|b| b.slot == slot) {
            return Err(EngineError::DuplicateBlackout { studio, date, slot });
        }

        let blackout = BlackoutSlot {
            id: Ulid::new(),
            studio,
            date,
            slot,
            is_available: false,
            created_by,
        };
        let event = Event::BlackoutCreated {
            blackout: blackout.clone(),
        };
        self.commit(std::slice::from_ref(&event)).await?;
        self.apply_blackout_created(&mut guard, &blackout);
        Ok(blackout)
    }

    /// Staff bulk path: block one recurring (studio, start, end) triple on
    /// many dates at once. Past dates are dropped, dates with a confirmed
    /// overlapping reservation are dropped (raw interval — no buffer on the
    /// administrative path), and pre-existing identical rows are skipped so
    /// retries are idempotent.
    pub async fn bulk_create_blackout(
        &self,
        studio: Studio,
        dates: Vec<NaiveDate>,
        start: Minute,
        end: Minute,
        created_by: String,
        now: NaiveDateTime,
    ) -> Result<BulkBlackoutOutcome, EngineError> {
        let slot = check_slot(start, end)?;
        if created_by.len() > MAX_CREATOR_LEN {
            return Err(EngineError::LimitExceeded("creator reference too long"));
        }
        if dates.is_empty() {
            return Err(EngineError::MissingFields("dates"));
        }
        if dates.len() > MAX_BULK_DATES {
            return Err(EngineError::LimitExceeded("too many dates in one request"));
        }

        let today = now.date();
        let now_minute = (now.time().hour() * 60 + now.time().minute()) as Minute;
        let mut upcoming: Vec<NaiveDate> = dates
            .into_iter()
            .filter(|d| *d > today || (*d == today && slot.start > now_minute))
            .collect();
        if upcoming.is_empty() {
            return Err(EngineError::AllDatesInPast);
        }
        upcoming.sort();
        upcoming.dedup();

        // Sorted key order again; this is the only path locking many days.
        let mut guards = Vec::with_capacity(upcoming.len());
        for &date in &upcoming {
            let key = DayKey { studio, date };
            guards.push((date, self.day(key).write_owned().await));
        }

        let mut survivors = Vec::new();
        let mut fresh = Vec::new();
        for (i, (date, guard)) in guards.iter().enumerate() {
            let conflicted = guard
                .reservations_overlapping(slot)
                .any(|r| r.status == BookingStatus::Confirmed);
            if conflicted {
                continue;
            }
            survivors.push(*date);
            if !guard.blackouts.iter().any(|b| b.slot == slot) {
                if guard.entry_count() >= MAX_ENTRIES_PER_DAY {
                    return Err(EngineError::LimitExceeded("day schedule full"));
                }
                fresh.push(i);
            }
        }
        if survivors.is_empty() {
            return Err(EngineError::AllSlotsConflicted);
        }

        let mut events = Vec::with_capacity(fresh.len());
        let mut created = Vec::with_capacity(fresh.len());
        for &i in &fresh {
            let blackout = BlackoutSlot {
                id: Ulid::new(),
                studio,
                date: guards[i].0,
                slot,
                is_available: false,
                created_by: created_by.clone(),
            };
            events.push(Event::BlackoutCreated {
                blackout: blackout.clone(),
            });
            created.push((i, blackout));
        }
        self.commit(&events).await?;
        for (i, blackout) in &created {
            self.apply_blackout_created(&mut guards[*i].1, blackout);
        }
        drop(guards);

        Ok(BulkBlackoutOutcome {
            created: created.len(),
            dates: survivors,
        })
    }

    pub async fn delete_blackout(
        &self,
        selector: BlackoutSelector,
    ) -> Result<usize, EngineError> {
        match selector {
            BlackoutSelector::ById(id) => {
                let key = self
                    .day_of_blackout(&id)
                    .ok_or(EngineError::NotFound(id))?;
                let day = self.day(key);
                let mut guard = day.write_owned().await;
                if !guard.blackouts.iter().any(|b| b.id == id) {
                    return Err(EngineError::NotFound(id));
                }
                let event = Event::BlackoutDeleted { id, key };
                self.commit(std::slice::from_ref(&event)).await?;
                self.apply_blackout_deleted(&mut guard, id);
                Ok(1)
            }
            BlackoutSelector::ByRange { studio, from, to } => {
                if from > to {
                    return Err(EngineError::MissingFields("date range out of order"));
                }
                let mut keys: Vec<DayKey> = self
                    .day_keys()
                    .into_iter()
                    .filter(|k| k.studio == studio && k.date >= from && k.date <= to)
                    .collect();
                keys.sort();

                let mut deleted = 0usize;
                for key in keys {
                    let day = self.day(key);
                    let mut guard = day.write_owned().await;
                    let ids: Vec<Ulid> = guard.blackouts.iter().map(|b| b.id).collect();
                    for id in ids {
                        let event = Event::BlackoutDeleted { id, key };
                        self.commit(std::slice::from_ref(&event)).await?;
                        self.apply_blackout_deleted(&mut guard, id);
                        deleted += 1;
                    }
                }
                if deleted == 0 {
                    return Err(EngineError::NoBlackoutsInRange);
                }
                Ok(deleted)
            }
        }
    }

    // ── Reminders ────────────────────────────────────────

    /// Flip one pending reminder to sent. Used by the reminder pump after a
    /// dispatch attempt; racing pumps lose with `NotFound`.
    pub async fn mark_reminder_sent(
        &self,
        reservation_id: Ulid,
        kind: ReminderKind,
    ) -> Result<(), EngineError> {
        let has_pending = self
            .reminders_for(reservation_id)
            .iter()
            .any(|r| r.kind == kind && r.status == ReminderStatus::Pending);
        if !has_pending {
            return Err(EngineError::NotFound(reservation_id));
        }
        let event = Event::ReminderSent {
            reservation_id,
            kind,
        };
        self.commit(std::slice::from_ref(&event)).await?;
        self.apply_reminder_event(&event);
        Ok(())
    }
}

fn check_contact_limits(
    name: &Option<String>,
    email: &Option<String>,
) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if let Some(e) = email
        && e.len() > MAX_EMAIL_LEN
    {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    Ok(())
}
