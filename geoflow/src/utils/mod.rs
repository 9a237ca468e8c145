//! Utility functions for run identifiers and timestamp handling.

pub mod timestamps;

pub use timestamps::{format_timestamp, iso_timestamp, system_time_iso, unix_nanos, Timestamp};

/// Generates a time-ordered run identifier (UUID v7).
#[must_use]
pub fn generate_run_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
