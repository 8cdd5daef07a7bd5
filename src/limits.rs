use crate::model::{DAY_MS, Ms};

pub const MAX_LOCATIONS: usize = 10_000;
pub const MAX_CHAIRS_PER_LOCATION: usize = 10_000;
pub const MAX_SERVICES: usize = 10_000;
pub const MAX_BLACKOUTS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;

/// Reservations plus attachment rows held by one chair.
pub const MAX_ROWS_PER_CHAIR: usize = 1_000_000;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_DRINK_QUANTITY: i64 = 10_000;
pub const MAX_PRICE_CENTS: i64 = 100_000_000;

/// 1970-01-01 .. 2100-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 3_660 * DAY_MS;

pub const MAX_STORES: usize = 1_024;
pub const MAX_STORE_NAME_LEN: usize = 64;
pub const MAX_LINE_LEN: usize = 64 * 1024;
