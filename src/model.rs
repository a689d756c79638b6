use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every transition timestamp.
pub type Ms = i64;

/// Half-open time-of-day window `[start, end)` on a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Windows touching at a boundary do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// ISO weekdays (1 = Monday .. 7 = Sunday) packed into a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    /// Build from ISO day numbers. Duplicates collapse; `None` if any day is outside 1..=7.
    pub fn from_days(days: &[u8]) -> Option<Self> {
        let mut bits = 0u8;
        for &d in days {
            if !(1..=7).contains(&d) {
                return None;
            }
            bits |= 1 << (d - 1);
        }
        Some(Self(bits))
    }

    pub fn every_day() -> Self {
        Self(0b0111_1111)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains_day(&self, day: u8) -> bool {
        (1..=7).contains(&day) && self.0 & (1 << (day - 1)) != 0
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.contains_day(date.weekday().number_from_monday() as u8)
    }

    pub fn days(&self) -> Vec<u8> {
        (1..=7).filter(|d| self.contains_day(*d)).collect()
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days: Vec<String> = self.days().iter().map(|d| d.to_string()).collect();
        write!(f, "{}", days.join(","))
    }
}

/// Prices travel through the log as decimal text.
mod decimal_text {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Decimal, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ── Catalog snapshot (owned by the catalog service) ─────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource_id: Ulid,
    /// Units consumed by one occurrence, independent of participants.
    pub quantity_needed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tour {
    pub id: Ulid,
    #[serde(with = "decimal_text")]
    pub base_price: Decimal,
    pub min_participants: u32,
    pub max_participants: Option<u32>,
    pub requirements: Vec<ResourceRequirement>,
}

impl Tour {
    pub fn slot_capacity(&self) -> u32 {
        self.max_participants
            .unwrap_or(crate::limits::DEFAULT_SLOT_CAPACITY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub total_quantity: u32,
    pub seats_per_unit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityTemplate {
    pub id: Ulid,
    pub tour_id: Ulid,
    pub weekdays: WeekdaySet,
    pub day_start: NaiveTime,
    pub day_end: NaiveTime,
    pub slot_duration_minutes: u32,
    pub break_duration_minutes: u32,
    pub active: bool,
}

/// Fields of a template that may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateUpdate {
    pub weekdays: Option<WeekdaySet>,
    pub day_start: Option<NaiveTime>,
    pub day_end: Option<NaiveTime>,
    pub slot_duration_minutes: Option<u32>,
    pub break_duration_minutes: Option<u32>,
    pub active: Option<bool>,
}

// ── Slots and the resource ledger ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Cancelled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCommitment {
    pub resource_id: Ulid,
    pub slot_id: Ulid,
    pub quantity_used: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub tour_id: Ulid,
    /// `None` for manually created slots.
    pub template_id: Option<Ulid>,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub total_capacity: u32,
    /// Seats held by pending/confirmed/paid bookings. Only the slot's write lock mutates it.
    pub booked_count: u32,
    pub status: SlotStatus,
    pub notes: Option<String>,
    pub commitments: Vec<ResourceCommitment>,
}

impl TimeSlot {
    pub fn free_seats(&self) -> u32 {
        self.total_capacity.saturating_sub(self.booked_count)
    }
}

/// Fields of a slot that may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotUpdate {
    pub total_capacity: Option<u32>,
    pub notes: Option<String>,
}

/// A slot together with the bookings it owns for capacity purposes.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: TimeSlot,
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(slot: TimeSlot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Σ participants of bookings that hold a seat, recomputed from the rows.
    pub fn seated_participants(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.status.holds_seat())
            .map(|b| b.participants)
            .sum()
    }

    pub fn participants_with(&self, statuses: &[BookingStatus]) -> u32 {
        self.bookings
            .iter()
            .filter(|b| statuses.contains(&b.status))
            .map(|b| b.participants)
            .sum()
    }
}

/// One commitment row as seen from the resource side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub quantity: u32,
}

/// Commitments of one resource by live slots, sorted by `(date, window.start)`.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    pub resource_id: Ulid,
    pub entries: Vec<LedgerEntry>,
}

impl ResourceLedger {
    pub fn new(resource_id: Ulid) -> Self {
        Self {
            resource_id,
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: LedgerEntry) {
        let key = (entry.date, entry.window.start);
        let pos = self
            .entries
            .partition_point(|e| (e.date, e.window.start) <= key);
        self.entries.insert(pos, entry);
    }

    pub fn remove_slot(&mut self, slot_id: Ulid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.slot_id != slot_id);
        before - self.entries.len()
    }

    /// Entries on `date` whose window overlaps `window`.
    pub fn overlapping(
        &self,
        date: NaiveDate,
        window: TimeWindow,
    ) -> impl Iterator<Item = &LedgerEntry> {
        let lo = self.entries.partition_point(|e| e.date < date);
        // Anything starting at or after window.end on the same date cannot overlap.
        let hi = self
            .entries
            .partition_point(|e| (e.date, e.window.start) < (date, window.end));
        self.entries[lo..hi.max(lo)]
            .iter()
            .filter(move |e| e.window.end > window.start)
    }

    /// Units committed in windows overlapping `window`, ignoring `exclude_slot`.
    pub fn used(&self, date: NaiveDate, window: &TimeWindow, exclude_slot: Option<Ulid>) -> u32 {
        self.overlapping(date, *window)
            .filter(|e| Some(e.slot_id) != exclude_slot)
            .fold(0u32, |acc, e| acc.saturating_add(e.quantity))
    }
}

// ── Bookings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Paid,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 5] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Paid,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Paid => "paid",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Pending, confirmed and paid bookings occupy seats on their slot.
    pub fn holds_seat(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Paid
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    fn forward_rank(&self) -> Option<u8> {
        match self {
            BookingStatus::Pending => Some(0),
            BookingStatus::Confirmed => Some(1),
            BookingStatus::Paid => Some(2),
            BookingStatus::Completed => Some(3),
            BookingStatus::Cancelled => None,
        }
    }

    /// `pending → confirmed → paid → completed`, forward jumps allowed except
    /// straight from pending to completed; cancellation from any non-terminal state.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.forward_rank(), next.forward_rank()) {
            (_, None) => true,
            (Some(_), Some(3)) => *self != BookingStatus::Pending,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "paid" => Ok(BookingStatus::Paid),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// Who the booking is for. The engine stores it as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerIdentity {
    Registered {
        user_id: String,
    },
    Guest {
        name: String,
        phone: String,
        email: Option<String>,
    },
}

/// Everything a caller supplies to reserve seats on a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub participants: u32,
    pub customer: CustomerIdentity,
    pub notes: Option<String>,
    /// Defaults to pending.
    pub initial_status: Option<BookingStatus>,
}

/// Contact fields of a guest booking that may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingUpdate {
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
}

/// Informational snapshot of the resource units a booking consumes. No price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingResourceLine {
    pub resource_id: Ulid,
    pub units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub code: String,
    pub slot_id: Ulid,
    pub tour_id: Ulid,
    pub customer: CustomerIdentity,
    pub participants: u32,
    #[serde(with = "decimal_text")]
    pub total_price: Decimal,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub confirmed_at: Option<Ms>,
    pub paid_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub notes: Option<String>,
    pub resources: Vec<BookingResourceLine>,
}

impl Booking {
    /// Record entry into `status` at `at`. Timestamps are only set on first entry.
    pub fn enter_status(&mut self, status: BookingStatus, at: Ms) {
        self.status = status;
        match status {
            BookingStatus::Pending => {}
            BookingStatus::Confirmed => {
                self.confirmed_at.get_or_insert(at);
            }
            BookingStatus::Paid => {
                self.paid_at.get_or_insert(at);
                self.confirmed_at.get_or_insert(at);
            }
            BookingStatus::Completed => {
                self.completed_at.get_or_insert(at);
            }
            BookingStatus::Cancelled => {
                self.cancelled_at.get_or_insert(at);
            }
        }
    }

    /// Notes only ever grow; each addition carries a UTC timestamp prefix.
    pub fn append_note(&mut self, at: Ms, note: &str) {
        let note = note.trim();
        if note.is_empty() {
            return;
        }
        let stamp = DateTime::<Utc>::from_timestamp_millis(at)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| at.to_string());
        let line = format!("[{stamp}] {note}");
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{line}"),
            _ => line,
        });
    }
}

// ── Event log records ───────────────────────────────────────────

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TourUpserted {
        id: Ulid,
        #[serde(with = "decimal_text")]
        base_price: Decimal,
        min_participants: u32,
        max_participants: Option<u32>,
    },
    RequirementSet {
        tour_id: Ulid,
        resource_id: Ulid,
        /// Zero removes the requirement.
        quantity_needed: u32,
    },
    ResourceUpserted {
        id: Ulid,
        name: String,
        total_quantity: u32,
        seats_per_unit: u32,
    },
    TemplateUpserted {
        template: AvailabilityTemplate,
    },
    TemplateDeleted {
        id: Ulid,
    },
    /// A slot and all of its resource commitments, written as one record.
    /// `replaced` names a booking-free slot removed in the same step.
    SlotCreated {
        slot: TimeSlot,
        replaced: Option<Ulid>,
    },
    SlotUpdated {
        id: Ulid,
        tour_id: Ulid,
        total_capacity: u32,
        notes: Option<String>,
    },
    SlotCancelled {
        id: Ulid,
        tour_id: Ulid,
    },
    SlotDeleted {
        id: Ulid,
        tour_id: Ulid,
    },
    /// A booking and its resource-line snapshot, written as one record.
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        slot_id: Ulid,
        tour_id: Ulid,
        status: BookingStatus,
        at: Ms,
        note: Option<String>,
    },
    BookingContactUpdated {
        id: Ulid,
        slot_id: Ulid,
        tour_id: Ulid,
        customer: CustomerIdentity,
    },
    BookingDeleted {
        id: Ulid,
        slot_id: Ulid,
        tour_id: Ulid,
    },
}

impl Event {
    /// Tour whose notification channel receives this event.
    pub fn tour_id(&self) -> Option<Ulid> {
        match self {
            Event::TourUpserted { id, .. } => Some(*id),
            Event::RequirementSet { tour_id, .. } => Some(*tour_id),
            Event::TemplateUpserted { template } => Some(template.tour_id),
            Event::SlotCreated { slot, .. } => Some(slot.tour_id),
            Event::BookingCreated { booking } => Some(booking.tour_id),
            Event::SlotUpdated { tour_id, .. }
            | Event::SlotCancelled { tour_id, .. }
            | Event::SlotDeleted { tour_id, .. }
            | Event::BookingStatusChanged { tour_id, .. }
            | Event::BookingContactUpdated { tour_id, .. }
            | Event::BookingDeleted { tour_id, .. } => Some(*tour_id),
            Event::ResourceUpserted { .. } | Event::TemplateDeleted { .. } => None,
        }
    }
}

// ── Operation results ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub slots_created: u32,
    pub slots_skipped: u32,
    /// `date, time: resource X needs N, available M`
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewDay {
    pub date: NaiveDate,
    pub weekday: u8,
    pub slots: u32,
    pub day_start: NaiveTime,
    pub day_end: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationPreview {
    pub template_id: Ulid,
    pub tour_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_slots: u32,
    pub days: Vec<PreviewDay>,
    pub requirements: Vec<ResourceRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestLine {
    pub resource_id: Ulid,
    pub resource_name: String,
    pub units_needed: u32,
    pub seats_per_unit: u32,
    pub capacity: u32,
    pub quantity_available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    pub total_price: Decimal,
    pub manifest: Vec<ManifestLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuote {
    pub total_price: Decimal,
    pub manifest: Vec<ManifestLine>,
    pub available: bool,
    pub free_seats: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAvailability {
    pub ok: bool,
    pub free_seats: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyStatus {
    Available,
    PartiallyBooked,
    FullyBooked,
    Cancelled,
}

impl OccupancyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccupancyStatus::Available => "available",
            OccupancyStatus::PartiallyBooked => "partially_booked",
            OccupancyStatus::FullyBooked => "fully_booked",
            OccupancyStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    pub slot_id: Ulid,
    pub total_capacity: u32,
    pub booked: u32,
    pub free: u32,
    /// Seats held by pending bookings.
    pub pending_count: u32,
    /// Seats held by confirmed or paid bookings.
    pub confirmed_count: u32,
    /// Bookings not cancelled, completed ones included.
    pub bookings_count: u32,
    pub status: OccupancyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyAudit {
    pub slot_id: Ulid,
    pub counter: u32,
    pub recomputed: u32,
}

impl OccupancyAudit {
    pub fn is_consistent(&self) -> bool {
        self.counter == self.recomputed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total: u32,
    pub pending: u32,
    pub confirmed: u32,
    pub paid: u32,
    pub completed: u32,
    pub cancelled: u32,
    /// Σ total price over confirmed, paid and completed bookings.
    pub revenue: Decimal,
    /// Σ participants over the same bookings as `revenue`.
    pub participants: u32,
}

pub fn time_of_day(secs_from_midnight: u32) -> Option<NaiveTime> {
    NaiveTime::from_num_seconds_from_midnight_opt(secs_from_midnight, 0)
}

pub fn secs_from_midnight(t: NaiveTime) -> u32 {
    t.num_seconds_from_midnight()
}
