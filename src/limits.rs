//! Hard caps that keep a single tenant or request from exhausting the server.

use crate::model::{DAY_MS, Ms, Won};

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_STAFF_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_TENANT: usize = 1_000_000;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 100_000;
pub const MAX_ENTRIES_PER_RESERVATION: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4096;
/// Rows in one multi-row INSERT.
pub const MAX_BATCH_SIZE: usize = 1000;

/// 1970-01-01 .. 9999-12-31.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest single booking or closure.
pub const MAX_SPAN_DURATION_MS: Ms = 400 * DAY_MS;
/// Longest stay a reservation may cover.
pub const MAX_RESERVATION_DAYS: i64 = 366;
/// Widest availability/vacancy query.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * DAY_MS;

pub const MAX_HEADCOUNT: u32 = 100_000;
pub const MAX_AMOUNT: Won = 10_000_000_000_000;
