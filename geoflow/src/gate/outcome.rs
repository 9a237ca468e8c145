//! Readiness gate outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened when a service was gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateOutcome {
    /// The probe succeeded.
    Ready {
        /// Time spent waiting in milliseconds.
        elapsed_ms: f64,
        /// Probe attempts made.
        attempts: u32,
    },
    /// The probe never succeeded within the timeout. The service is left running.
    TimedOut {
        /// Time spent waiting in milliseconds.
        elapsed_ms: f64,
        /// Probe attempts made.
        attempts: u32,
        /// Why the last probe attempt failed.
        last_error: String,
    },
    /// The probe is misconfigured.
    ProbeError {
        /// The configuration problem.
        message: String,
    },
    /// The start command failed.
    StartFailed {
        /// What went wrong.
        message: String,
        /// Last lines of the start command's output.
        #[serde(default)]
        tail: Vec<String>,
    },
    /// Prerequisite artifacts are not valid; nothing was started or probed.
    PrerequisitesMissing {
        /// `name: validity` descriptions.
        missing: Vec<String>,
    },
    /// The run was cancelled while waiting.
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

impl GateOutcome {
    /// Returns true if the service is ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready { elapsed_ms, attempts } => write!(
                f,
                "ready after {:.1}s ({attempts} probe{})",
                elapsed_ms / 1000.0,
                if *attempts == 1 { "" } else { "s" }
            ),
            Self::TimedOut {
                elapsed_ms,
                attempts,
                last_error,
            } => write!(
                f,
                "not ready after {:.1}s and {attempts} probes; last error: {last_error}",
                elapsed_ms / 1000.0
            ),
            Self::ProbeError { message } => write!(f, "probe misconfigured: {message}"),
            Self::StartFailed { message, .. } => write!(f, "start command failed: {message}"),
            Self::PrerequisitesMissing { missing } => {
                write!(f, "prerequisites not valid: {}", missing.join("; "))
            }
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}
