use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minute-of-day. Slot ends may reach `DAY_END` (exclusive midnight).
pub type Minute = u16;

pub const DAY_END: Minute = 1440;

/// Parse a wall-clock `HH:MM` string to a minute-of-day in `[0, 1439]`.
pub fn to_minutes(hhmm: &str) -> Option<Minute> {
    let (h, m) = hhmm.split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Format a minute-of-day as zero-padded `HH:MM`. `1440` renders as `24:00`.
pub fn from_minutes(minute: Minute) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

fn minute_to_time(minute: Minute) -> NaiveTime {
    NaiveTime::from_hms_opt(u32::from(minute) / 60, u32::from(minute) % 60, 0)
        .expect("minute-of-day in range")
}

/// The three physical studios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Studio {
    A,
    B,
    C,
}

impl Studio {
    pub const ALL: [Studio; 3] = [Studio::A, Studio::B, Studio::C];
}

impl std::fmt::Display for Studio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Studio::A => write!(f, "a"),
            Studio::B => write!(f, "b"),
            Studio::C => write!(f, "c"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlotRepr {
    start: String,
    end: String,
}

/// Half-open interval `[start, end)` in minutes of one day.
/// Serialized as `HH:MM` strings on every surface (wire, WAL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SlotRepr", into = "SlotRepr")]
pub struct Slot {
    pub start: Minute,
    pub end: Minute,
}

impl Slot {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Slot start must be before end");
        debug_assert!(end <= DAY_END, "Slot end must stay within the day");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Symmetric buffer expansion, clamped to the day's bounds. Used only on
    /// the query side of conflict checks; stored slots are never expanded.
    pub fn expanded(&self, buffer: Minute) -> Slot {
        Slot {
            start: self.start.saturating_sub(buffer),
            end: self.end.saturating_add(buffer).min(DAY_END),
        }
    }
}

impl From<Slot> for SlotRepr {
    fn from(slot: Slot) -> Self {
        Self {
            start: from_minutes(slot.start),
            end: from_minutes(slot.end),
        }
    }
}

impl TryFrom<SlotRepr> for Slot {
    type Error = String;

    fn try_from(repr: SlotRepr) -> Result<Self, String> {
        let start =
            to_minutes(&repr.start).ok_or_else(|| format!("bad time: {}", repr.start))?;
        let end = if repr.end == "24:00" {
            DAY_END
        } else {
            to_minutes(&repr.end).ok_or_else(|| format!("bad time: {}", repr.end))?
        };
        if start >= end {
            return Err(format!("empty slot: {}-{}", repr.start, repr.end));
        }
        Ok(Slot { start, end })
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", from_minutes(self.start), from_minutes(self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Whether a reservation in this status still occupies its slot.
    /// Everything else is history, not occupancy.
    pub fn occupies(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Exactly 10 digits after normalization.
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// A claim on one studio for a contiguous time range on one calendar date.
/// All timestamps are facility wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub studio: Studio,
    pub date: NaiveDate,
    pub slot: Slot,
    pub status: BookingStatus,
    pub contact: Contact,
    /// `round(rate_per_hour × duration_hours)`, if a rate was supplied.
    pub total: Option<i64>,
    pub calendar_event_ref: Option<String>,
    pub confirmation_email_sent: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub cancelled_at: Option<NaiveDateTime>,
}

impl Reservation {
    pub fn key(&self) -> DayKey {
        DayKey {
            studio: self.studio,
            date: self.date,
        }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(minute_to_time(self.slot.start))
    }
}

/// An administrator-declared unavailable interval, independent of any
/// reservation. `is_available` exists for schema symmetry; the admin path
/// always writes `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutSlot {
    pub id: Ulid,
    pub studio: Studio,
    pub date: NaiveDate,
    pub slot: Slot,
    pub is_available: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Confirmation,
    DayBefore,
    HourBefore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub reservation_id: Ulid,
    pub kind: ReminderKind,
    pub fire_at: NaiveDateTime,
    pub status: ReminderStatus,
}

/// The unit of locking and storage: one studio on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub studio: Studio,
    pub date: NaiveDate,
}

/// One studio's schedule for one date: reservations and blackout slots,
/// both kept sorted by slot start.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub key: DayKey,
    pub reservations: Vec<Reservation>,
    pub blackouts: Vec<BlackoutSlot>,
}

impl DaySchedule {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
            blackouts: Vec::new(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.reservations.len() + self.blackouts.len()
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.slot.start, |r| r.slot.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// All reservations whose slot overlaps the probe, regardless of status.
    /// Binary search skips everything starting at or after `probe.end`.
    pub fn reservations_overlapping(&self, probe: Slot) -> impl Iterator<Item = &Reservation> {
        let right = self
            .reservations
            .partition_point(|r| r.slot.start < probe.end);
        self.reservations[..right]
            .iter()
            .filter(move |r| r.slot.end > probe.start)
    }

    /// Overlapping reservations that still occupy their slot.
    pub fn occupying(&self, probe: Slot) -> impl Iterator<Item = &Reservation> {
        self.reservations_overlapping(probe)
            .filter(|r| r.status.occupies())
    }

    pub fn insert_blackout(&mut self, blackout: BlackoutSlot) {
        let pos = self
            .blackouts
            .binary_search_by_key(&blackout.slot.start, |b| b.slot.start)
            .unwrap_or_else(|e| e);
        self.blackouts.insert(pos, blackout);
    }

    pub fn remove_blackout(&mut self, id: Ulid) -> Option<BlackoutSlot> {
        let pos = self.blackouts.iter().position(|b| b.id == id)?;
        Some(self.blackouts.remove(pos))
    }

    pub fn blackouts_overlapping(&self, probe: Slot) -> impl Iterator<Item = &BlackoutSlot> {
        let right = self.blackouts.partition_point(|b| b.slot.start < probe.end);
        self.blackouts[..right]
            .iter()
            .filter(move |b| b.slot.end > probe.start)
    }
}

// ── Engine inputs ────────────────────────────────────────────────

/// A customer-facing booking request. Times are raw minutes so the engine
/// owns the `end > start` validation, not the type system.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub studio: Studio,
    pub date: NaiveDate,
    pub start: Minute,
    pub end: Minute,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub rate_per_hour: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub reservation_id: Ulid,
    pub phone: String,
    pub studio: Studio,
    pub date: NaiveDate,
    pub start: Minute,
    pub end: Minute,
    /// `None` leaves the stored value untouched.
    pub name: Option<String>,
    pub email: Option<String>,
    pub rate_per_hour: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Requester {
    Customer { phone: String },
    /// Pre-authenticated staff context; ownership check is bypassed.
    Staff,
}

#[derive(Debug, Clone)]
pub enum BlackoutSelector {
    ById(Ulid),
    ByRange {
        studio: Studio,
        from: NaiveDate,
        to: NaiveDate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkBlackoutOutcome {
    /// Rows actually inserted; identical pre-existing rows are skipped.
    pub created: usize,
    /// Dates that survived the past-date and conflict filters.
    pub dates: Vec<NaiveDate>,
}

// ── WAL record format ────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationBooked {
        reservation: Reservation,
    },
    /// Full post-modification snapshot; may move the reservation to another
    /// (studio, date).
    ReservationModified {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        status: BookingStatus,
        at: NaiveDateTime,
        reason: Option<String>,
    },
    BlackoutCreated {
        blackout: BlackoutSlot,
    },
    BlackoutDeleted {
        id: Ulid,
        key: DayKey,
    },
    RemindersScheduled {
        reservation_id: Ulid,
        batch: Vec<ReminderRecord>,
    },
    RemindersCancelled {
        reservation_id: Ulid,
    },
    ReminderSent {
        reservation_id: Ulid,
        kind: ReminderKind,
    },
    ExternalRefsRecorded {
        id: Ulid,
        calendar_event_ref: Option<String>,
        email_sent: bool,
    },
}
