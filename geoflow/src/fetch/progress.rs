//! Throttled download progress reporting.

use crate::events::{names, EventSink};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Bytes received during this fetch, across all attempts.
    pub received: u64,
    /// Current length of the partial file.
    pub position: u64,
    /// Total length, if the source advertised it.
    pub total: Option<u64>,
    /// Average rate since the fetch started.
    pub bytes_per_sec: f64,
}

#[derive(Debug)]
struct ProgressState {
    received: u64,
    position: u64,
    total: Option<u64>,
    resumed_from: Option<u64>,
    started: Instant,
    last_emit: Instant,
}

/// Publishes `fetch.progress` events at most once per interval, regardless
/// of how the body is chunked.
pub struct ProgressReporter {
    artifact: String,
    interval: Duration,
    events: Arc<dyn EventSink>,
    state: Mutex<ProgressState>,
}

impl ProgressReporter {
    /// Creates a reporter for one artifact.
    #[must_use]
    pub fn new(artifact: impl Into<String>, interval: Duration, events: Arc<dyn EventSink>) -> Self {
        let now = Instant::now();
        Self {
            artifact: artifact.into(),
            interval,
            events,
            state: Mutex::new(ProgressState {
                received: 0,
                position: 0,
                total: None,
                resumed_from: None,
                started: now,
                last_emit: now,
            }),
        }
    }

    /// Starts an attempt at `start` of `total` bytes.
    pub fn begin(&self, start: u64, total: Option<u64>) {
        let mut state = self.state.lock();
        state.position = start;
        state.total = total;
        state.resumed_from.get_or_insert(start);
    }

    /// Records `bytes` written, leaving the file at `position`.
    pub fn advance(&self, bytes: u64, position: u64) {
        let snapshot = {
            let mut state = self.state.lock();
            state.received += bytes;
            state.position = position;
            let now = Instant::now();
            if now.duration_since(state.last_emit) < self.interval {
                return;
            }
            state.last_emit = now;
            Self::snapshot_of(&state)
        };
        self.publish(&snapshot);
    }

    /// Publishes the final report.
    pub fn finish(&self) -> ProgressSnapshot {
        let snapshot = self.snapshot();
        self.publish(&snapshot);
        info!(
            artifact = %self.artifact,
            bytes = snapshot.position,
            received = snapshot.received,
            bytes_per_sec = snapshot.bytes_per_sec,
            "transfer complete"
        );
        snapshot
    }

    /// Returns the current progress.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        Self::snapshot_of(&self.state.lock())
    }

    /// Offset the first attempt started from.
    #[must_use]
    pub fn resumed_from(&self) -> u64 {
        self.state.lock().resumed_from.unwrap_or(0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot_of(state: &ProgressState) -> ProgressSnapshot {
        let secs = state.started.elapsed().as_secs_f64();
        ProgressSnapshot {
            received: state.received,
            position: state.position,
            total: state.total,
            bytes_per_sec: if secs > 0.0 { state.received as f64 / secs } else { 0.0 },
        }
    }

    fn publish(&self, snapshot: &ProgressSnapshot) {
        self.events.try_emit(
            names::FETCH_PROGRESS,
            Some(serde_json::json!({
                "artifact": self.artifact,
                "received": snapshot.received,
                "position": snapshot.position,
                "total": snapshot.total,
                "bytes_per_sec": snapshot.bytes_per_sec,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;

    #[test]
    fn test_progress_is_throttled_independent_of_chunks() {
        let sink = Arc::new(CollectingEventSink::new());
        let reporter = ProgressReporter::new("raw", Duration::from_secs(3600), sink.clone());
        reporter.begin(0, Some(1_000));
        for i in 1..=1_000 {
            reporter.advance(1, i);
        }
        assert!(sink.is_empty());

        let last = reporter.finish();
        assert_eq!(sink.len(), 1);
        assert_eq!(last.received, 1_000);
        assert_eq!(last.position, 1_000);
    }

    #[test]
    fn test_zero_interval_reports_every_chunk() {
        let sink = Arc::new(CollectingEventSink::new());
        let reporter = ProgressReporter::new("raw", Duration::ZERO, sink.clone());
        reporter.begin(0, None);
        reporter.advance(10, 10);
        reporter.advance(10, 20);
        assert_eq!(sink.events_of_type("fetch.progress").len(), 2);
    }

    #[test]
    fn test_received_is_monotonic_across_attempts() {
        let sink = Arc::new(CollectingEventSink::new());
        let reporter = ProgressReporter::new("raw", Duration::from_secs(3600), sink);
        reporter.begin(100, Some(300));
        reporter.advance(50, 150);
        // Second attempt restarts from zero; received keeps growing.
        reporter.begin(0, Some(300));
        reporter.advance(300, 300);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.received, 350);
        assert_eq!(snapshot.position, 300);
        assert_eq!(reporter.resumed_from(), 100);
    }
}
