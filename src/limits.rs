use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest stay or price period accepted (about two years).
pub const MAX_SPAN_DURATION_MS: Ms = 2 * 366 * 86_400_000;

pub const MAX_RECORDS_PER_SCOPE: usize = 50_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_PERMISSIONS_PER_USER: usize = 256;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_ROUTE_LEN: usize = 512;
