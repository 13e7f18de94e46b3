use crate::model::{Ms, DAY_MS, MINUTE_MS};

pub const MAX_ITEMS: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_SLOTS_PER_ITEM: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOGIN_LEN: usize = 128;
pub const MAX_PROFILE_FIELD_LEN: usize = 256;

/// Slots never span more than one day.
pub const MAX_SLOT_DURATION_MS: Ms = DAY_MS;
pub const MIN_SLOT_DURATION_MS: Ms = MINUTE_MS;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Widest range accepted by `available_days`.
pub const MAX_DAY_RANGE: Ms = 366 * DAY_MS;
