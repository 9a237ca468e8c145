//! Timestamp helpers for reports and artifact freshness checks.

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// Format: `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`
///
/// # Examples
///
/// ```
/// use geoflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Formats a UTC timestamp the same way as [`iso_timestamp`].
#[must_use]
pub fn format_timestamp(ts: Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Formats a filesystem time (e.g. an artifact mtime) as ISO 8601.
#[must_use]
pub fn system_time_iso(time: SystemTime) -> String {
    format_timestamp(DateTime::<Utc>::from(time))
}

/// Nanoseconds since the Unix epoch, saturating at the bounds of `u64`.
///
/// Used as the persisted cache watermark; pre-epoch times map to zero.
#[must_use]
pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }

    #[test]
    fn test_system_time_iso() {
        let t = UNIX_EPOCH + Duration::from_secs(86_400);
        assert_eq!(system_time_iso(t), "1970-01-02T00:00:00.000000+00:00");
    }

    #[test]
    fn test_unix_nanos_is_monotonic() {
        let a = UNIX_EPOCH + Duration::from_millis(1500);
        let b = a + Duration::from_nanos(1);
        assert_eq!(unix_nanos(a), 1_500_000_000);
        assert!(unix_nanos(b) > unix_nanos(a));
        assert_eq!(unix_nanos(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }
}
