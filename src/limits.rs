use crate::model::Ms;

pub const DAY_MS: Ms = 86_400_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Default cap on availability and schedule query width.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
/// Longest window a single task may reserve.
pub const MAX_SPAN_DURATION_MS: Ms = 10 * 366 * DAY_MS;

pub const MAX_ALLOCATIONS_PER_PAIR: usize = 100_000;
pub const MAX_REQUESTS_PER_TASK: usize = 256;
pub const MAX_PAIRS_PER_SCHEDULE: usize = 4_096;
pub const MAX_GROUP_DEPTH: usize = 64;
