mod availability;
mod error;
mod mutations;
mod queries;
mod validate;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use error::{EngineError, ErrorCategory};
pub use validate::{digits, local_now, normalize_phone, MODIFY_CUTOFF_HOURS};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{self, NotificationDispatcher, PostCommit};
use crate::wal::Wal;

pub type SharedDaySchedule = Arc<RwLock<DaySchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the current batch first, then handle the
                            // non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch.as_slice());
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The reservation engine: one lockable `DaySchedule` per (studio, date),
/// a WAL behind a group-commit writer task, and the id→day indexes that
/// make modify/cancel O(1) lookups.
pub struct Engine {
    days: DashMap<DayKey, SharedDaySchedule>,
    wal_tx: mpsc::Sender<WalCommand>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    /// reservation id → the day currently holding it
    reservation_days: DashMap<Ulid, DayKey>,
    /// blackout id → its day
    blackout_days: DashMap<Ulid, DayKey>,
    /// reservation id → all reminder records ever derived for it
    reminders: DashMap<Ulid, Vec<ReminderRecord>>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            wal_tx,
            dispatcher,
            reservation_days: DashMap::new(),
            blackout_days: DashMap::new(),
            reminders: DashMap::new(),
        };

        // Replay — we're the sole owner of every day Arc here, so try_write
        // always succeeds instantly. Never use blocking_write: replay may run
        // inside an async context.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    pub fn dispatcher(&self) -> Arc<dyn NotificationDispatcher> {
        self.dispatcher.clone()
    }

    /// Get or lazily create the shared schedule for a day. Mutation paths
    /// only; read paths peek at the map without inserting.
    pub(super) fn day(&self, key: DayKey) -> SharedDaySchedule {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key))))
            .value()
            .clone()
    }

    pub(super) fn peek_day(&self, key: &DayKey) -> Option<SharedDaySchedule> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub(super) fn day_of_reservation(&self, id: &Ulid) -> Option<DayKey> {
        self.reservation_days.get(id).map(|e| *e.value())
    }

    pub(super) fn day_of_blackout(&self, id: &Ulid) -> Option<DayKey> {
        self.blackout_days.get(id).map(|e| *e.value())
    }

    pub(super) fn day_keys(&self) -> Vec<DayKey> {
        self.days.iter().map(|e| *e.key()).collect()
    }

    /// Write an event to the WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably commit a sequence of events for one operation. Called with the
    /// involved day write guards held; nothing is applied in memory until
    /// every append has been acknowledged.
    pub(super) async fn commit(&self, events: &[Event]) -> Result<(), EngineError> {
        for event in events {
            self.wal_append(event).await?;
        }
        Ok(())
    }

    /// Hand a committed operation to the notification fan-out. Must be called
    /// after the day guards have been dropped.
    pub(super) fn publish(&self, event: PostCommit) {
        tokio::spawn(notify::fan_out(self.dispatcher.clone(), event));
    }

    // ── State application ────────────────────────────────
    //
    // Shared between live mutations (guards held by the caller) and replay
    // (uncontended try_write), so the two can never drift.

    pub(super) fn apply_booked(&self, day: &mut DaySchedule, reservation: &Reservation) {
        day.insert_reservation(reservation.clone());
        self.reservation_days.insert(reservation.id, day.key);
    }

    /// Re-insert an updated snapshot within the same day (slot order may
    /// have changed).
    pub(super) fn apply_rebooked(&self, day: &mut DaySchedule, reservation: &Reservation) {
        day.remove_reservation(reservation.id);
        day.insert_reservation(reservation.clone());
        self.reservation_days.insert(reservation.id, day.key);
    }

    pub(super) fn apply_moved(
        &self,
        old_day: &mut DaySchedule,
        new_day: &mut DaySchedule,
        reservation: &Reservation,
    ) {
        old_day.remove_reservation(reservation.id);
        new_day.insert_reservation(reservation.clone());
        self.reservation_days.insert(reservation.id, new_day.key);
    }

    pub(super) fn apply_status_changed(
        day: &mut DaySchedule,
        id: Ulid,
        status: BookingStatus,
        at: NaiveDateTime,
    ) {
        if let Some(r) = day.reservation_mut(id) {
            r.status = status;
            r.updated_at = at;
            if status == BookingStatus::Cancelled {
                r.cancelled_at = Some(at);
            }
        }
    }

    pub(super) fn apply_blackout_created(&self, day: &mut DaySchedule, blackout: &BlackoutSlot) {
        day.insert_blackout(blackout.clone());
        self.blackout_days.insert(blackout.id, day.key);
    }

    pub(super) fn apply_blackout_deleted(&self, day: &mut DaySchedule, id: Ulid) {
        day.remove_blackout(id);
        self.blackout_days.remove(&id);
    }

    pub(super) fn apply_external_refs(
        day: &mut DaySchedule,
        id: Ulid,
        calendar_event_ref: &Option<String>,
        email_sent: bool,
    ) {
        if let Some(r) = day.reservation_mut(id) {
            if calendar_event_ref.is_some() {
                r.calendar_event_ref = calendar_event_ref.clone();
            }
            r.confirmation_email_sent = r.confirmation_email_sent || email_sent;
        }
    }

    pub(super) fn apply_reminder_event(&self, event: &Event) {
        match event {
            Event::RemindersScheduled {
                reservation_id,
                batch,
            } => {
                self.reminders
                    .entry(*reservation_id)
                    .or_default()
                    .extend(batch.iter().cloned());
            }
            Event::RemindersCancelled { reservation_id } => {
                if let Some(mut records) = self.reminders.get_mut(reservation_id) {
                    for record in records.iter_mut() {
                        if record.status == ReminderStatus::Pending {
                            record.status = ReminderStatus::Cancelled;
                        }
                    }
                }
            }
            Event::ReminderSent {
                reservation_id,
                kind,
            } => {
                if let Some(mut records) = self.reminders.get_mut(reservation_id)
                    && let Some(record) = records
                        .iter_mut()
                        .find(|r| r.kind == *kind && r.status == ReminderStatus::Pending)
                {
                    record.status = ReminderStatus::Sent;
                }
            }
            _ => {}
        }
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ReservationBooked { reservation } => {
                let day = self.day(reservation.key());
                let mut guard = day.try_write().expect("replay: uncontended write");
                self.apply_booked(&mut guard, reservation);
            }
            Event::ReservationModified { reservation } => {
                let new_key = reservation.key();
                match self.day_of_reservation(&reservation.id) {
                    Some(old_key) if old_key != new_key => {
                        let old_day = self.day(old_key);
                        let new_day = self.day(new_key);
                        let mut old_guard =
                            old_day.try_write().expect("replay: uncontended write");
                        let mut new_guard =
                            new_day.try_write().expect("replay: uncontended write");
                        self.apply_moved(&mut old_guard, &mut new_guard, reservation);
                    }
                    _ => {
                        let day = self.day(new_key);
                        let mut guard = day.try_write().expect("replay: uncontended write");
                        self.apply_rebooked(&mut guard, reservation);
                    }
                }
            }
            Event::ReservationStatusChanged { id, status, at, .. } => {
                if let Some(key) = self.day_of_reservation(id) {
                    let day = self.day(key);
                    let mut guard = day.try_write().expect("replay: uncontended write");
                    Self::apply_status_changed(&mut guard, *id, *status, *at);
                }
            }
            Event::BlackoutCreated { blackout } => {
                let key = DayKey {
                    studio: blackout.studio,
                    date: blackout.date,
                };
                let day = self.day(key);
                let mut guard = day.try_write().expect("replay: uncontended write");
                self.apply_blackout_created(&mut guard, blackout);
            }
            Event::BlackoutDeleted { id, key } => {
                let day = self.day(*key);
                let mut guard = day.try_write().expect("replay: uncontended write");
                self.apply_blackout_deleted(&mut guard, *id);
            }
            Event::ExternalRefsRecorded {
                id,
                calendar_event_ref,
                email_sent,
            } => {
                if let Some(key) = self.day_of_reservation(id) {
                    let day = self.day(key);
                    let mut guard = day.try_write().expect("replay: uncontended write");
                    Self::apply_external_refs(&mut guard, *id, calendar_event_ref, *email_sent);
                }
            }
            Event::RemindersScheduled { .. }
            | Event::RemindersCancelled { .. }
            | Event::ReminderSent { .. } => self.apply_reminder_event(event),
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for key in self.day_keys() {
            let Some(day) = self.peek_day(&key) else {
                continue;
            };
            let guard = day.read().await;
            for reservation in &guard.reservations {
                events.push(Event::ReservationBooked {
                    reservation: reservation.clone(),
                });
            }
            for blackout in &guard.blackouts {
                events.push(Event::BlackoutCreated {
                    blackout: blackout.clone(),
                });
            }
        }
        for entry in self.reminders.iter() {
            events.push(Event::RemindersScheduled {
                reservation_id: *entry.key(),
                batch: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
