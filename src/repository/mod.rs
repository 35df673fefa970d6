//! Repository layer for database persistence.
//!
//! All database access uses Diesel ORM with compile-time query checking.
//! Supports both SQLite and PostgreSQL backends.

pub mod context;
pub mod groups;
pub mod models;
pub mod pool;
pub mod util;
pub mod work_items;

pub use context::DbContext;
pub use groups::{GroupAllocation, GroupRepository};
pub use pool::{DbError, DbPool, LockKey};
pub use work_items::{ClaimOptions, WorkItemRepository};

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Format a timestamp for storage.
///
/// Fixed width with a `Z` suffix, so string comparison in SQL matches
/// chronological order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time formatted for storage.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Timestamp `age` in the past, formatted for storage.
pub fn timestamp_before(age: Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::weeks(5200));
    format_timestamp(Utc::now() - age)
}
