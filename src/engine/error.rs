use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Principal neither owns the entity nor is an admin.
    Forbidden(Ulid),
    InvalidInterval(&'static str),
    /// Slot taken out of service by an operator.
    SlotUnavailable(Ulid),
    /// Overlaps the named live booking.
    BookingConflict(Ulid),
    InvalidTransition {
        id: Ulid,
        status: BookingStatus,
        reason: &'static str,
    },
    Validation(&'static str),
    HasSlots(Ulid),
    HasLiveBookings(Ulid),
    LimitExceeded(&'static str),
    /// WAL failure. Nothing was applied; safe to retry.
    Storage(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(id) => write!(f, "forbidden: {id}"),
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::SlotUnavailable(id) => write!(f, "slot unavailable: {id}"),
            EngineError::BookingConflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::InvalidTransition { id, status, reason } => {
                write!(f, "invalid transition for booking {id} ({status}): {reason}")
            }
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::HasSlots(id) => write!(f, "cannot delete place {id}: has slots"),
            EngineError::HasLiveBookings(id) => {
                write!(f, "cannot delete slot {id}: has live bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
