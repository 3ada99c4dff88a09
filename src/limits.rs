//! Structural caps. Every unbounded input the wire can reach is clamped by
//! one of these so a single misbehaving client cannot balloon memory or the WAL.

/// Maximum number of properties one server process will host.
pub const MAX_PROPERTIES: usize = 256;

/// Maximum length of a property name (doubles as the WAL file stem).
pub const MAX_PROPERTY_NAME_LEN: usize = 64;

/// Maximum number of seasonal rate rules per property.
pub const MAX_SEASONS: usize = 512;

/// Maximum live calendar entries (holds plus bookings) per property.
pub const MAX_CALENDAR_ENTRIES: usize = 4096;

/// Longest bookable stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Widest window a calendar query may ask for, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3660;

/// Hard bounds on every date accepted over the wire. Keeps arithmetic on
/// date offsets comfortably inside chrono's representable range.
pub const MIN_STAY_YEAR: i32 = 2000;
pub const MAX_STAY_YEAR: i32 = 2100;

/// Maximum length of a season name.
pub const MAX_SEASON_NAME_LEN: usize = 128;

/// Maximum length of a single guest contact field (name, email, phone).
pub const MAX_CONTACT_FIELD_LEN: usize = 256;
