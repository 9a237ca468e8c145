//! The run report: an ordered, immutable record of one orchestrator run.

use super::{DurationClass, StageOutcome, StageStatus};
use crate::errors::ErrorKind;
use crate::exit_codes;
use crate::gate::GateOutcome;
use crate::utils::{generate_run_id, iso_timestamp};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Instant;

/// Outcome of fetching one source artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    /// The artifact was already valid.
    Skipped {
        /// Why nothing was downloaded.
        reason: String,
    },
    /// The artifact was downloaded and verified.
    Downloaded {
        /// Final size in bytes.
        bytes: u64,
        /// Offset the transfer resumed from (0 for a fresh download).
        resumed_from: u64,
        /// Time spent in milliseconds.
        duration_ms: f64,
    },
    /// The download failed.
    Failed {
        /// Error classification.
        kind: ErrorKind,
        /// Error description, including the file state left behind.
        message: String,
    },
}

/// One fetch entry in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRecord {
    /// Destination artifact name.
    pub artifact: String,
    /// Source URL.
    pub url: String,
    /// What happened.
    pub outcome: FetchStatus,
}

/// One stage entry in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub stage: String,
    /// Declared duration class.
    pub duration_class: DurationClass,
    /// When evaluation of the stage started (ISO 8601).
    pub started_at: String,
    /// What happened.
    pub outcome: StageOutcome,
}

impl StageRecord {
    /// Returns the stage status.
    #[must_use]
    pub const fn status(&self) -> StageStatus {
        self.outcome.status()
    }
}

/// What happened to a cache domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CacheAction {
    /// The domain was cleared.
    Cleared,
    /// The domain was already consistent with its upstream artifacts.
    Fresh,
    /// Clearing failed; the domain was left untouched.
    Failed {
        /// Error description.
        message: String,
    },
}

/// One cache entry in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Cache domain name.
    pub domain: String,
    /// What triggered the reconcile (a stage name, or `pre-serve`).
    pub trigger: String,
    /// What happened.
    pub action: CacheAction,
}

/// One service entry in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service name.
    pub service: String,
    /// Gate outcome.
    pub outcome: GateOutcome,
}

/// Which step made the run fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A source artifact could not be fetched.
    FetchFailed,
    /// A stage failed.
    StageFailed,
    /// A cache domain could not be cleared.
    CacheFailed,
    /// A service's prerequisites were not valid.
    PrerequisitesMissing,
    /// A service did not become ready in time.
    ReadinessTimeout,
    /// A service could not be started or probed.
    ServiceFailed,
    /// The run was cancelled.
    Cancelled,
}

impl FailureKind {
    /// Process exit code for this failure.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::FetchFailed => exit_codes::FETCH_FAILED,
            Self::StageFailed => exit_codes::STAGE_FAILED,
            Self::CacheFailed => exit_codes::CACHE_FAILED,
            Self::PrerequisitesMissing => exit_codes::PREREQUISITES_MISSING,
            Self::ReadinessTimeout => exit_codes::READINESS_TIMEOUT,
            Self::ServiceFailed => exit_codes::SERVICE_FAILED,
            Self::Cancelled => exit_codes::CANCELLED,
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Everything completed and every service is ready.
    Succeeded,
    /// The run failed.
    Failed {
        /// Which step failed.
        kind: FailureKind,
        /// The artifact, stage, cache domain or service involved.
        subject: String,
        /// Failure description.
        message: String,
    },
}

/// Immutable record of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Start time (ISO 8601).
    pub started_at: String,
    /// End time (ISO 8601).
    pub finished_at: String,
    /// Total elapsed time in milliseconds.
    pub elapsed_ms: f64,
    /// Fetch outcomes, in order.
    pub fetches: Vec<FetchRecord>,
    /// Stage outcomes, in execution order.
    pub stages: Vec<StageRecord>,
    /// Cache reconcile outcomes, in order.
    pub caches: Vec<CacheRecord>,
    /// Service gate outcomes, in order.
    pub services: Vec<ServiceRecord>,
    /// Final status.
    pub status: RunStatus,
}

impl RunReport {
    /// Returns true if the run succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded)
    }

    /// Process exit code for this run.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match &self.status {
            RunStatus::Succeeded => exit_codes::SUCCESS,
            RunStatus::Failed { kind, .. } => kind.exit_code(),
        }
    }

    /// Looks up a stage record by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == name)
    }

    /// Returns the first failed stage, if any.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.status() == StageStatus::Failed)
    }

    /// Looks up a service record by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|r| r.service == name)
    }

    /// Serializes the report as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders a short human-readable summary.
    #[must_use]
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "pipeline '{}' run {}", self.pipeline, self.run_id);
        for fetch in &self.fetches {
            let line = match &fetch.outcome {
                FetchStatus::Skipped { reason } => format!("skipped ({reason})"),
                FetchStatus::Downloaded { bytes, resumed_from, .. } if *resumed_from > 0 => {
                    format!("downloaded {bytes} bytes (resumed at {resumed_from})")
                }
                FetchStatus::Downloaded { bytes, .. } => format!("downloaded {bytes} bytes"),
                FetchStatus::Failed { message, .. } => format!("FAILED: {message}"),
            };
            let _ = writeln!(out, "  fetch   {:<20} {line}", fetch.artifact);
        }
        for stage in &self.stages {
            let line = match &stage.outcome {
                StageOutcome::Skipped { reason } => format!("skipped ({reason})"),
                StageOutcome::Succeeded { duration_ms } => {
                    format!("succeeded in {:.1}s", duration_ms / 1000.0)
                }
                StageOutcome::Failed(failure) => format!("FAILED: {}", failure.reason),
            };
            let _ = writeln!(out, "  stage   {:<20} {line}", stage.stage);
        }
        for cache in &self.caches {
            let line = match &cache.action {
                CacheAction::Cleared => format!("cleared (after {})", cache.trigger),
                CacheAction::Fresh => "fresh".to_string(),
                CacheAction::Failed { message } => format!("FAILED: {message}"),
            };
            let _ = writeln!(out, "  cache   {:<20} {line}", cache.domain);
        }
        for service in &self.services {
            let _ = writeln!(out, "  service {:<20} {}", service.service, service.outcome);
        }
        let _ = match &self.status {
            RunStatus::Succeeded => writeln!(
                out,
                "succeeded in {:.1}s",
                self.elapsed_ms / 1000.0
            ),
            RunStatus::Failed {
                kind,
                subject,
                message,
            } => writeln!(out, "failed ({kind:?} at '{subject}'): {message}"),
        };
        out
    }
}

/// Accumulates entries during a run and produces the final [`RunReport`].
#[derive(Debug)]
pub struct RunRecorder {
    run_id: String,
    pipeline: String,
    started_at: String,
    start: Instant,
    fetches: Vec<FetchRecord>,
    stages: Vec<StageRecord>,
    caches: Vec<CacheRecord>,
    services: Vec<ServiceRecord>,
    cancelled: Option<String>,
}

impl RunRecorder {
    /// Starts recording a run of `pipeline`.
    #[must_use]
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            run_id: generate_run_id(),
            pipeline: pipeline.into(),
            started_at: iso_timestamp(),
            start: Instant::now(),
            fetches: Vec::new(),
            stages: Vec::new(),
            caches: Vec::new(),
            services: Vec::new(),
            cancelled: None,
        }
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Records a fetch.
    pub fn record_fetch(&mut self, record: FetchRecord) {
        self.fetches.push(record);
    }

    /// Records a stage outcome.
    pub fn record_stage(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    /// Records a cache reconcile.
    pub fn record_cache(&mut self, record: CacheRecord) {
        self.caches.push(record);
    }

    /// Records a service gate outcome.
    pub fn record_service(&mut self, record: ServiceRecord) {
        self.services.push(record);
    }

    /// Marks the run as cancelled.
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) {
        self.cancelled.get_or_insert_with(|| reason.into());
    }

    /// Returns true if any fetch, stage or cache step failed so far.
    #[must_use]
    pub fn has_failure(&self) -> bool {
        self.cancelled.is_some()
            || self
                .fetches
                .iter()
                .any(|f| matches!(f.outcome, FetchStatus::Failed { .. }))
            || self.stages.iter().any(|s| s.status() == StageStatus::Failed)
            || self
                .caches
                .iter()
                .any(|c| matches!(c.action, CacheAction::Failed { .. }))
    }

    fn derive_status(&self) -> RunStatus {
        if let Some(reason) = &self.cancelled {
            return RunStatus::Failed {
                kind: FailureKind::Cancelled,
                subject: "run".to_string(),
                message: reason.clone(),
            };
        }
        for fetch in &self.fetches {
            if let FetchStatus::Failed { message, .. } = &fetch.outcome {
                return RunStatus::Failed {
                    kind: FailureKind::FetchFailed,
                    subject: fetch.artifact.clone(),
                    message: message.clone(),
                };
            }
        }
        for stage in &self.stages {
            if let StageOutcome::Failed(failure) = &stage.outcome {
                return RunStatus::Failed {
                    kind: FailureKind::StageFailed,
                    subject: stage.stage.clone(),
                    message: failure.reason.to_string(),
                };
            }
        }
        for cache in &self.caches {
            if let CacheAction::Failed { message } = &cache.action {
                return RunStatus::Failed {
                    kind: FailureKind::CacheFailed,
                    subject: cache.domain.clone(),
                    message: message.clone(),
                };
            }
        }
        for service in &self.services {
            let kind = match &service.outcome {
                GateOutcome::Ready { .. } => continue,
                GateOutcome::TimedOut { .. } => FailureKind::ReadinessTimeout,
                GateOutcome::PrerequisitesMissing { .. } => FailureKind::PrerequisitesMissing,
                GateOutcome::ProbeError { .. } | GateOutcome::StartFailed { .. } => {
                    FailureKind::ServiceFailed
                }
                GateOutcome::Cancelled { .. } => FailureKind::Cancelled,
            };
            return RunStatus::Failed {
                kind,
                subject: service.service.clone(),
                message: service.outcome.to_string(),
            };
        }
        RunStatus::Succeeded
    }

    /// Finishes the run. The returned report is never modified again.
    #[must_use]
    pub fn finish(self) -> RunReport {
        let status = self.derive_status();
        RunReport {
            run_id: self.run_id,
            pipeline: self.pipeline,
            started_at: self.started_at,
            finished_at: iso_timestamp(),
            elapsed_ms: self.start.elapsed().as_secs_f64() * 1000.0,
            fetches: self.fetches,
            stages: self.stages,
            caches: self.caches,
            services: self.services,
            status,
        }
    }
}
