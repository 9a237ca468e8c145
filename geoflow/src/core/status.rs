//! Stage status and duration class enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rough expected runtime of a stage. Used only for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationClass {
    /// Seconds.
    Short,
    /// Minutes.
    #[default]
    Medium,
    /// Up to an hour or so.
    Long,
    /// Hours (continent-sized extracts, full imports).
    VeryLong,
}

impl fmt::Display for DurationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Short => write!(f, "short"),
            Self::Medium => write!(f, "medium"),
            Self::Long => write!(f, "long"),
            Self::VeryLong => write!(f, "very_long"),
        }
    }
}

/// The execution status of a stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not evaluated yet.
    #[default]
    Pending,
    /// The external command is running.
    Running,
    /// Outputs were already valid and fresh; nothing ran.
    Skipped,
    /// The command ran and produced valid outputs.
    Succeeded,
    /// The command failed or broke its output contract.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Skipped => write!(f, "skipped"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded | Self::Failed)
    }

    /// Returns true if downstream stages may proceed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Skipped.to_string(), "skipped");
        assert_eq!(StageStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(!StageStatus::Failed.is_success());
    }

    #[test]
    fn test_duration_class_serialize() {
        let json = serde_json::to_string(&DurationClass::VeryLong).unwrap();
        assert_eq!(json, r#""very_long""#);
        let back: DurationClass = serde_json::from_str(r#""short""#).unwrap();
        assert_eq!(back, DurationClass::Short);
    }
}
