use crate::model::{HOUR_MS, Ms};

pub const MAX_PLACES: usize = 10_000;
pub const MAX_SLOTS_PER_PLACE: usize = 5_000;
/// Pending or confirmed bookings on one slot. Terminal history does not count.
pub const MAX_LIVE_BOOKINGS_PER_SLOT: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_PLATE_LEN: usize = 32;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_PAYMENT_FIELD_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SPAN_DURATION_MS: Ms = 90 * 24 * HOUR_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * HOUR_MS;

pub const MAX_RATE: f64 = 1_000_000.0;
pub const MAX_PAGE_SIZE: usize = 1_000;
pub const DEFAULT_PAGE_SIZE: usize = 100;
