//! Error types for the geoflow orchestrator.
//!
//! Every failure carries enough context to name the artifact, stage or
//! service involved so that a re-run is informed rather than blind.

use crate::fetch::FetchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of failures, used for propagation and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable I/O: network blips, stalled transfers, momentary contention.
    TransientIo,
    /// Size or hash mismatch; needs an operator re-fetch.
    CorruptArtifact,
    /// An external tool exited non-zero or broke its output contract.
    ExternalToolFailure,
    /// Invalid pipeline definition, detected before anything runs.
    ConfigurationError,
    /// A service's prerequisite artifacts are not valid.
    PrerequisitesMissing,
    /// A service did not become ready in time.
    ReadinessTimeout,
    /// The run was cancelled.
    Cancelled,
    /// Another run holds the data directory.
    Locked,
    /// Anything else (local filesystem errors, state corruption).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransientIo => "transient_io",
            Self::CorruptArtifact => "corrupt_artifact",
            Self::ExternalToolFailure => "external_tool_failure",
            Self::ConfigurationError => "configuration_error",
            Self::PrerequisitesMissing => "prerequisites_missing",
            Self::ReadinessTimeout => "readiness_timeout",
            Self::Cancelled => "cancelled",
            Self::Locked => "locked",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Diagnostic payload attached to configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a pipeline definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages, artifacts or services involved.
    pub subjects: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            subjects: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the subjects involved.
    #[must_use]
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when the stage dependency graph contains a cycle.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "PIPELINE-CYCLE",
            format!("Stage dependencies form a cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("A stage may not consume, directly or indirectly, an artifact it produces.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            subjects: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// The main error type for geoflow operations.
#[derive(Debug, Error)]
pub enum GeoflowError {
    /// The pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The pipeline definition could not be read or parsed.
    #[error("failed to load pipeline definition {path}: {reason}")]
    Definition {
        /// The definition file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Fetching a source artifact failed.
    #[error("{0}")]
    Fetch(#[from] FetchError),

    /// A stage failed.
    #[error("stage '{stage}' failed: {reason}")]
    StageFailed {
        /// The failing stage.
        stage: String,
        /// The failure description.
        reason: String,
    },

    /// A service's prerequisites are not valid.
    #[error("service '{service}' is missing prerequisites: {}", missing.join(", "))]
    PrerequisitesMissing {
        /// The affected service.
        service: String,
        /// Names of the invalid prerequisite artifacts.
        missing: Vec<String>,
    },

    /// A service did not become ready within its timeout.
    #[error("service '{service}' not ready after {elapsed_secs:.1}s: {last_error}")]
    ReadinessTimeout {
        /// The affected service.
        service: String,
        /// How long the gate waited.
        elapsed_secs: f64,
        /// The last probe failure reason.
        last_error: String,
    },

    /// A service could not be started or probed.
    #[error("service '{service}' failed: {reason}")]
    ServiceFailed {
        /// The affected service.
        service: String,
        /// The failure description.
        reason: String,
    },

    /// A cache domain could not be cleared.
    #[error("cache domain '{domain}' could not be cleared: {reason}")]
    CacheFailed {
        /// The affected cache domain.
        domain: String,
        /// The failure description.
        reason: String,
    },

    /// Another orchestrator run holds the data directory.
    #[error("data directory is locked by another run ({})", describe_holder(*holder))]
    Locked {
        /// The lock file.
        path: PathBuf,
        /// The pid recorded in the lock file, if readable.
        holder: Option<u32>,
    },

    /// The run was cancelled.
    #[error("run cancelled: {0}")]
    Cancelled(String),

    /// The persisted run state could not be read or written.
    #[error("run state error at {path}: {reason}")]
    State {
        /// The state file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_holder(holder: Option<u32>) -> String {
    holder.map_or_else(|| "pid unknown".to_string(), |pid| format!("pid {pid}"))
}

impl GeoflowError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Definition { .. } => ErrorKind::ConfigurationError,
            Self::Fetch(err) => err.kind(),
            Self::StageFailed { .. } | Self::ServiceFailed { .. } => ErrorKind::ExternalToolFailure,
            Self::PrerequisitesMissing { .. } => ErrorKind::PrerequisitesMissing,
            Self::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::CacheFailed { .. } | Self::State { .. } | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Fetch(_) => crate::exit_codes::FETCH_FAILED,
            Self::StageFailed { .. } => crate::exit_codes::STAGE_FAILED,
            Self::PrerequisitesMissing { .. } => crate::exit_codes::PREREQUISITES_MISSING,
            Self::ReadinessTimeout { .. } => crate::exit_codes::READINESS_TIMEOUT,
            Self::ServiceFailed { .. } => crate::exit_codes::SERVICE_FAILED,
            Self::CacheFailed { .. } => crate::exit_codes::CACHE_FAILED,
            Self::Locked { .. } => crate::exit_codes::LOCKED,
            Self::Cancelled(_) => crate::exit_codes::CANCELLED,
            Self::Validation(_) | Self::Definition { .. } | Self::State { .. } | Self::Io(_) => {
                crate::exit_codes::GENERAL
            }
        }
    }
}
