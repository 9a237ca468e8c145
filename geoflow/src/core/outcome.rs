//! Per-stage outcomes produced by the stage executor.

use super::StageStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// Input artifacts were not valid; the command was never started.
    InputsInvalid {
        /// `name: validity` descriptions.
        artifacts: Vec<String>,
    },
    /// The command template could not be rendered.
    Template {
        /// The rendering problem.
        message: String,
    },
    /// The process could not be spawned.
    SpawnFailed {
        /// The OS error.
        message: String,
    },
    /// The process exited non-zero or was killed by a signal.
    ExitStatus {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
    /// The process exited 0 but declared outputs are not valid.
    InvalidOutputs {
        /// `name: validity` descriptions.
        artifacts: Vec<String>,
    },
    /// The stage exceeded its wall-clock timeout and was killed.
    TimedOut {
        /// The timeout in seconds.
        timeout_secs: u64,
    },
    /// The run was cancelled while the stage ran.
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
    /// A service the stage needs could not be brought up.
    Preflight {
        /// What the preflight hook reported.
        message: String,
    },
    /// The run state could not be updated.
    State {
        /// The state store error.
        message: String,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputsInvalid { artifacts } => {
                write!(f, "input artifacts not valid: {}", artifacts.join("; "))
            }
            Self::Template { message } => write!(f, "command template error: {message}"),
            Self::SpawnFailed { message } => write!(f, "could not start command: {message}"),
            Self::ExitStatus { code: Some(code) } => write!(f, "command exited with status {code}"),
            Self::ExitStatus { code: None } => write!(f, "command was terminated by a signal"),
            Self::InvalidOutputs { artifacts } => write!(
                f,
                "command exited 0 but outputs are not valid: {}",
                artifacts.join("; ")
            ),
            Self::TimedOut { timeout_secs } => write!(f, "timed out after {timeout_secs}s"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            Self::Preflight { message } => write!(f, "required service unavailable: {message}"),
            Self::State { message } => write!(f, "could not update run state: {message}"),
        }
    }
}

/// Details of a failed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    /// What went wrong.
    pub reason: FailureReason,
    /// Exit code of the external tool, if it ran to completion.
    pub exit_code: Option<i32>,
    /// Last lines of the tool's stdout/stderr.
    #[serde(default)]
    pub tail: Vec<String>,
    /// Output artifacts left behind with unknown validity.
    #[serde(default)]
    pub left_behind: Vec<String>,
    /// Time spent in milliseconds.
    pub duration_ms: f64,
}

impl StageFailure {
    /// Creates a failure that happened before the command started.
    #[must_use]
    pub const fn before_start(reason: FailureReason) -> Self {
        Self {
            reason,
            exit_code: None,
            tail: Vec::new(),
            left_behind: Vec::new(),
            duration_ms: 0.0,
        }
    }
}

/// Outcome of running one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Outputs were valid and fresh; the command was not invoked.
    Skipped {
        /// Why the stage was skipped.
        reason: String,
    },
    /// The command ran and every output validated.
    Succeeded {
        /// Time spent in milliseconds.
        duration_ms: f64,
    },
    /// The stage failed.
    Failed(StageFailure),
}

impl StageOutcome {
    /// Returns the status for this outcome.
    #[must_use]
    pub const fn status(&self) -> StageStatus {
        match self {
            Self::Skipped { .. } => StageStatus::Skipped,
            Self::Succeeded { .. } => StageStatus::Succeeded,
            Self::Failed(_) => StageStatus::Failed,
        }
    }

    /// Returns the failure details, if failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns true if the command actually ran to success.
    #[must_use]
    pub const fn ran(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}
