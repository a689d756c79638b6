//! Hard limits and defaults enforced by the engine and the SQL surface.

/// Seats given to a generated or manual slot when the tour has no max participants.
pub const DEFAULT_SLOT_CAPACITY: u32 = 10;

/// Longest single slot a template may carve (8 hours).
pub const MAX_SLOT_DURATION_MINUTES: u32 = 480;

/// Longest break a template may put between slots.
pub const MAX_BREAK_DURATION_MINUTES: u32 = 24 * 60;

/// Widest date range a single generation or preview may cover.
pub const MAX_GENERATION_DAYS: i64 = 365;

pub const MAX_SLOT_CAPACITY: u32 = 10_000;
pub const MAX_PARTICIPANTS_PER_BOOKING: u32 = 1_000;
pub const MAX_RESOURCE_QUANTITY: u32 = 100_000;
pub const MAX_REQUIREMENTS_PER_TOUR: usize = 64;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_NOTES_LEN: usize = 4_096;

/// Booking codes are retried this many times before giving up on a collision.
pub const MAX_CODE_ATTEMPTS: usize = 16;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
