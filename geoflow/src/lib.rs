//! # Geoflow
//!
//! A staged, resumable build-and-bring-up orchestrator for geodata.
//!
//! Geoflow turns a raw geographic extract into a running map or routing
//! service:
//!
//! - **Fetch**: resumable, verified downloads of source artifacts
//! - **Build**: external transformation tools run as stages of an artifact
//!   DAG, skipped when their outputs are valid and fresh
//! - **Cache**: derived caches cleared when their upstream artifacts change
//! - **Serve**: services started only after their prerequisites validate,
//!   then probed until ready
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use geoflow::prelude::*;
//!
//! let loaded = PipelineDefinition::load("pipeline.yaml")?.into_pipeline(None)?;
//! let source = Arc::new(HttpSource::new(loaded.settings.fetch.connect_timeout())?);
//! let orchestrator = Orchestrator::new(loaded, source, Arc::new(ProcessRunner::new()));
//!
//! let report = orchestrator.run(&RunOptions::default()).await?;
//! println!("{}", report.render_summary());
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod gate;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod stages;
pub mod state;
pub mod testing;
pub mod utils;

/// Process exit codes.
pub mod exit_codes {
    /// Full success.
    pub const SUCCESS: u8 = 0;
    /// Configuration or internal error.
    pub const GENERAL: u8 = 1;
    /// Command-line usage error.
    pub const USAGE: u8 = 2;
    /// A source artifact could not be fetched.
    pub const FETCH_FAILED: u8 = 3;
    /// A stage failed.
    pub const STAGE_FAILED: u8 = 4;
    /// A service's prerequisites were not valid.
    pub const PREREQUISITES_MISSING: u8 = 5;
    /// A service did not become ready in time.
    pub const READINESS_TIMEOUT: u8 = 6;
    /// A service could not be started or probed.
    pub const SERVICE_FAILED: u8 = 7;
    /// Another run holds the data directory.
    pub const LOCKED: u8 = 8;
    /// A cache domain could not be cleared.
    pub const CACHE_FAILED: u8 = 9;
    /// Interrupted.
    pub const CANCELLED: u8 = 130;
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheDomain, CacheInvalidator, ReconcileOutcome};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{FetchSettings, Settings};
    pub use crate::core::{
        Artifact, ArtifactCatalog, ContentHash, DurationClass, HashAlgorithm, RunReport,
        RunStatus, StageOutcome, StageStatus, Validity,
    };
    pub use crate::errors::{ErrorKind, GeoflowError, PipelineValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::fetch::{ArtifactSource, Fetcher, HttpSource, SourceSpec};
    pub use crate::gate::{GateOutcome, ProbeSpec, ReadinessGate, ServiceSpec};
    pub use crate::orchestrator::{Orchestrator, RunOptions};
    pub use crate::pipeline::{
        Force, Pipeline, PipelineBuilder, PipelineDefinition, Plan, Planner, StageSpec,
    };
    pub use crate::stages::{CommandRunner, ProcessRunner, StageExecutor};
    pub use crate::state::DataDir;
    pub use std::sync::Arc;
}
