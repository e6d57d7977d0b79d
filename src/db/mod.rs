//! Per-node relational store.

pub mod models;
pub mod sqlite;

pub use sqlite::Database;

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
