//! Event sinks for run progress.
//!
//! Components emit typed events (`fetch.progress`, `stage.started`,
//! `service.ready`, ...) through an [`EventSink`] handed to them at
//! construction. The CLI logs them; tests collect them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the orchestrator.
pub mod names {
    /// A download attempt started.
    pub const FETCH_STARTED: &str = "fetch.started";
    /// Periodic download progress.
    pub const FETCH_PROGRESS: &str = "fetch.progress";
    /// A transient failure will be retried.
    pub const FETCH_RETRY: &str = "fetch.retry";
    /// A download finished and validated.
    pub const FETCH_COMPLETED: &str = "fetch.completed";
    /// A download was skipped because the artifact is valid.
    pub const FETCH_SKIPPED: &str = "fetch.skipped";
    /// A download failed for good.
    pub const FETCH_FAILED: &str = "fetch.failed";
    /// A stage command started.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage was skipped.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage succeeded.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A cache domain was cleared.
    pub const CACHE_CLEARED: &str = "cache.cleared";
    /// A readiness probe failed and will be retried.
    pub const SERVICE_WAITING: &str = "service.waiting";
    /// A service became ready.
    pub const SERVICE_READY: &str = "service.ready";
    /// A service did not become ready.
    pub const SERVICE_FAILED: &str = "service.failed";
}
