//! Where progress events go.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Receives progress events from the fetcher, the stage executor, the cache
/// invalidator, the readiness gate and the orchestrator.
///
/// Event names are listed in [`names`](super::names). Sinks must not fail;
/// delivery problems are theirs to swallow.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Delivers an event from a context that cannot await, such as a
    /// progress callback or a retry hook.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to the `geoflow::events` tracing target.
///
/// Failures log at warn, high-frequency events (`fetch.progress`,
/// `service.waiting`) at debug, everything else at info.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl LoggingEventSink {
    fn log(event_type: &str, data: Option<&Value>) {
        let data = data.map(Value::to_string).unwrap_or_default();
        if event_type.ends_with(".failed") {
            warn!(target: "geoflow::events", event = event_type, %data);
        } else if matches!(event_type, "fetch.progress" | "service.waiting") {
            debug!(target: "geoflow::events", event = event_type, %data);
        } else {
            info!(target: "geoflow::events", event = event_type, %data);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        Self::log(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        Self::log(event_type, data.as_ref());
    }
}

/// Keeps every event in memory. For tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Event names in arrival order.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.events.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Events whose name starts with `prefix`, in arrival order.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| t.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Payload of the most recent event named exactly `event_type`.
    #[must_use]
    pub fn last(&self, event_type: &str) -> Option<Value> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|(t, _)| t == event_type)
            .and_then(|(_, data)| data.clone())
    }

    fn push(&self, event_type: &str, data: Option<Value>) {
        self.events.lock().push((event_type.to_string(), data));
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::names;
    use serde_json::json;

    #[tokio::test]
    async fn test_collecting_sink_keeps_order() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(names::FETCH_STARTED, None).await;
        sink.try_emit(names::FETCH_PROGRESS, Some(json!({ "received": 10 })));
        sink.try_emit(names::FETCH_PROGRESS, Some(json!({ "received": 20 })));
        sink.emit(names::STAGE_STARTED, Some(json!({ "stage": "extract" }))).await;

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.types()[0], "fetch.started");
        assert_eq!(sink.events_of_type("fetch.").len(), 3);
        assert_eq!(sink.last(names::FETCH_PROGRESS), Some(json!({ "received": 20 })));
        assert_eq!(sink.last(names::STAGE_FAILED), None);
    }

    #[tokio::test]
    async fn test_logging_and_noop_sinks_accept_everything() {
        for event in [names::FETCH_PROGRESS, names::STAGE_FAILED, names::SERVICE_READY] {
            LoggingEventSink.emit(event, Some(json!({ "x": 1 }))).await;
            LoggingEventSink.try_emit(event, None);
            NoOpEventSink.emit(event, None).await;
        }
    }
}
