use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Fractional hours, no rounding.
    pub fn duration_hours(&self) -> f64 {
        self.duration_ms() as f64 / HOUR_MS as f64
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Principal ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

/// Authenticated caller, supplied by the transport for every engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: Role::User }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins see everything; users only what they own.
    pub fn may_access(&self, owner: &str) -> bool {
        self.is_admin() || self.user_id == owner
    }
}

// ── Pricing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub hourly_rate: f64,
    pub daily_rate: Option<f64>,
}

impl Pricing {
    pub fn hourly(hourly_rate: f64) -> Self {
        Self { hourly_rate, daily_rate: None }
    }

    pub fn with_daily(hourly_rate: f64, daily_rate: f64) -> Self {
        Self { hourly_rate, daily_rate: Some(daily_rate) }
    }
}

// ── Slots ────────────────────────────────────────────────────────

/// Authoritative slot status. Recomputed from operator status + live bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Occupied,
    Reserved,
    Maintenance,
    OutOfService,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Occupied => "occupied",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Maintenance => "maintenance",
            SlotStatus::OutOfService => "out_of_service",
        }
    }
}

/// The derived boolean view. Never stored.
pub fn is_available(status: SlotStatus) -> bool {
    status == SlotStatus::Available
}

/// The part of a slot's status an operator controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorStatus {
    InService,
    Maintenance,
    OutOfService,
}

impl OperatorStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" | "in_service" => Some(OperatorStatus::InService),
            "maintenance" => Some(OperatorStatus::Maintenance),
            "out_of_service" => Some(OperatorStatus::OutOfService),
            _ => None,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    Expired,
}

impl BookingStatus {
    /// Live bookings count against slot availability.
    pub fn is_live(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "completed" => Some(BookingStatus::Completed),
            "expired" => Some(BookingStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub plate: String,
    pub kind: Option<String>,
}

impl Vehicle {
    pub fn plate(plate: impl Into<String>) -> Self {
        Self { plate: plate.into(), kind: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub method: Option<String>,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub paid_at: Option<Ms>,
}

impl Payment {
    pub fn unpaid() -> Self {
        Self { method: None, status: PaymentStatus::Unpaid, transaction_id: None, paid_at: None }
    }
}

/// Who did something, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub time: Ms,
    pub by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: Option<String>,
    pub cancelled_by: String,
    pub cancelled_at: Ms,
    pub refund_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    pub place_id: Ulid,
    pub slot_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub amount: f64,
    pub vehicle: Vehicle,
    pub payment: Payment,
    pub check_in: Option<Stamp>,
    pub check_out: Option<Stamp>,
    pub cancellation: Option<Cancellation>,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub place_id: Ulid,
    pub label: Option<String>,
    pub operator_status: OperatorStatus,
    /// Written only by `ledger::sync_slot_status`.
    pub status: SlotStatus,
    pub pricing: Pricing,
    /// Every booking ever made on this slot, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(id: Ulid, place_id: Ulid, label: Option<String>, pricing: Pricing) -> Self {
        Self {
            id,
            place_id,
            label,
            operator_status: OperatorStatus::InService,
            status: SlotStatus::Available,
            pricing,
            bookings: Vec::new(),
        }
    }

    /// Status as implied by operator status and live bookings.
    pub fn derive_status(&self) -> SlotStatus {
        match self.operator_status {
            OperatorStatus::Maintenance => return SlotStatus::Maintenance,
            OperatorStatus::OutOfService => return SlotStatus::OutOfService,
            OperatorStatus::InService => {}
        }
        let mut reserved = false;
        for b in self.bookings.iter().filter(|b| b.is_live()) {
            if b.check_in.is_some() {
                return SlotStatus::Occupied;
            }
            reserved = true;
        }
        if reserved { SlotStatus::Reserved } else { SlotStatus::Available }
    }

    pub fn in_service(&self) -> bool {
        self.operator_status == OperatorStatus::InService
    }

    pub fn has_live_bookings(&self) -> bool {
        self.bookings.iter().any(Booking::is_live)
    }

    pub fn live_booking_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.is_live()).count()
    }

    /// Insert booking maintaining sort order by span.start. Equal starts keep
    /// insertion order, so replaying a log rebuilds the same sequence.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

// ── Places ───────────────────────────────────────────────────────

/// Aggregate counters for a place. `available + reserved == total`;
/// slots under maintenance or out of service sit outside `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub total: u32,
    pub available: u32,
    pub reserved: u32,
    pub out_of_service: u32,
}

/// A place and everything under it. One lock guards the whole tree, so a
/// booking, its slot and the place counters always change together.
#[derive(Debug, Clone)]
pub struct PlaceState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Default for slots created without their own pricing.
    pub pricing: Pricing,
    pub capacity: Capacity,
    /// In creation order.
    pub slots: Vec<SlotState>,
}

impl PlaceState {
    pub fn new(id: Ulid, name: Option<String>, pricing: Pricing) -> Self {
        Self { id, name, pricing, capacity: Capacity::default(), slots: Vec::new() }
    }

    pub fn slot(&self, id: &Ulid) -> Option<&SlotState> {
        self.slots.iter().find(|s| s.id == *id)
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut SlotState> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.slots.iter().find_map(|s| s.booking(id))
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.slots.iter().flat_map(|s| s.bookings.iter())
    }
}

/// Flat event types, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PlaceCreated {
        id: Ulid,
        name: Option<String>,
        pricing: Pricing,
    },
    PlaceDeleted {
        id: Ulid,
    },
    SlotAdded {
        id: Ulid,
        place_id: Ulid,
        label: Option<String>,
        pricing: Pricing,
    },
    SlotStatusSet {
        id: Ulid,
        place_id: Ulid,
        status: OperatorStatus,
    },
    SlotRemoved {
        id: Ulid,
        place_id: Ulid,
    },
    /// Carries the whole booking; compaction re-emits terminal bookings this way too.
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        place_id: Ulid,
        span: Span,
        amount: f64,
        vehicle: Vehicle,
    },
    PaymentConfirmed {
        id: Ulid,
        place_id: Ulid,
        method: String,
        transaction_id: Option<String>,
        paid_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        place_id: Ulid,
        cancellation: Cancellation,
    },
    CheckedIn {
        id: Ulid,
        place_id: Ulid,
        stamp: Stamp,
    },
    CheckedOut {
        id: Ulid,
        place_id: Ulid,
        stamp: Stamp,
    },
    /// Checked-in bookings complete, everything else expires.
    BookingElapsed {
        id: Ulid,
        place_id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn place_id(&self) -> Ulid {
        match self {
            Event::PlaceCreated { id, .. } | Event::PlaceDeleted { id } => *id,
            Event::BookingCreated { booking } => booking.place_id,
            Event::SlotAdded { place_id, .. }
            | Event::SlotStatusSet { place_id, .. }
            | Event::SlotRemoved { place_id, .. }
            | Event::BookingRescheduled { place_id, .. }
            | Event::PaymentConfirmed { place_id, .. }
            | Event::BookingCancelled { place_id, .. }
            | Event::CheckedIn { place_id, .. }
            | Event::CheckedOut { place_id, .. }
            | Event::BookingElapsed { place_id, .. } => *place_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::PlaceCreated { .. } => "place_created",
            Event::PlaceDeleted { .. } => "place_deleted",
            Event::SlotAdded { .. } => "slot_added",
            Event::SlotStatusSet { .. } => "slot_status_set",
            Event::SlotRemoved { .. } => "slot_removed",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
            Event::PaymentConfirmed { .. } => "payment_confirmed",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::CheckedIn { .. } => "checked_in",
            Event::CheckedOut { .. } => "checked_out",
            Event::BookingElapsed { .. } => "booking_elapsed",
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub pricing: Pricing,
    pub capacity: Capacity,
    pub slot_count: usize,
}

impl PlaceInfo {
    pub fn from_state(ps: &PlaceState) -> Self {
        Self {
            id: ps.id,
            name: ps.name.clone(),
            pricing: ps.pricing,
            capacity: ps.capacity,
            slot_count: ps.slots.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub place_id: Ulid,
    pub label: Option<String>,
    pub status: SlotStatus,
    pub is_available: bool,
    pub pricing: Pricing,
    pub live_bookings: usize,
}

impl SlotInfo {
    pub fn from_state(slot: &SlotState) -> Self {
        Self {
            id: slot.id,
            place_id: slot.place_id,
            label: slot.label.clone(),
            status: slot.status,
            is_available: is_available(slot.status),
            pricing: slot.pricing,
            live_bookings: slot.bookings.iter().filter(|b| b.is_live()).count(),
        }
    }
}

/// Listing filter. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub place_id: Option<Ulid>,
    pub slot_id: Option<Ulid>,
    pub user_id: Option<String>,
    /// Bookings ending after this instant.
    pub from: Option<Ms>,
    /// Bookings starting before this instant.
    pub to: Option<Ms>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.status.is_none_or(|s| b.status == s)
            && self.place_id.is_none_or(|p| b.place_id == p)
            && self.slot_id.is_none_or(|s| b.slot_id == s)
            && self.user_id.as_deref().is_none_or(|u| b.user_id == u)
            && self.from.is_none_or(|t| b.span.end > t)
            && self.to.is_none_or(|t| b.span.start < t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: crate::limits::DEFAULT_PAGE_SIZE }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceReport {
    pub place_id: Ulid,
    pub capacity: Capacity,
    pub slots_occupied: u32,
    pub bookings_pending: u32,
    pub bookings_confirmed: u32,
    pub bookings_completed: u32,
    pub bookings_cancelled: u32,
    pub bookings_expired: u32,
    /// Sum of amounts of confirmed and completed bookings.
    pub revenue: f64,
    pub refunds: f64,
}
