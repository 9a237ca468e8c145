//! Structured logging for geoflow runs.
//!
//! Logs go to stderr through `tracing-subscriber`, either human-readable or
//! as one JSON object per line. `RUST_LOG` overrides the configured level.

use crate::core::{DurationClass, StageOutcome, StageStatus};
use crate::pipeline::StageSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// Newline-delimited JSON.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Installs the global tracing subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to `level`.
/// Calling this twice is harmless; the second call is ignored.
pub fn init_tracing(level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
}

/// Payload of `stage.completed` and `stage.failed` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageEventFields {
    /// Stage name.
    pub stage: String,
    /// Declared duration class.
    pub duration_class: DurationClass,
    /// Final status.
    pub status: StageStatus,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
    /// Exit code of the tool, when it ran to completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StageEventFields {
    /// Builds the payload for a finished stage.
    #[must_use]
    pub fn from_outcome(stage: &StageSpec, outcome: &StageOutcome, duration_ms: f64) -> Self {
        let failure = outcome.failure();
        Self {
            stage: stage.name.clone(),
            duration_class: stage.duration,
            status: outcome.status(),
            duration_ms,
            exit_code: failure.and_then(|f| f.exit_code),
            reason: failure.map(|f| f.reason.to_string()),
        }
    }

    /// Serializes to an event payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Measures one fetch or stage and logs its duration at debug when done.
#[derive(Debug)]
pub struct SpanTimer {
    label: String,
    started: Instant,
}

impl SpanTimer {
    /// Starts timing `label`.
    #[must_use]
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
        }
    }

    /// Milliseconds since [`start`](Self::start).
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Stops the timer and returns the elapsed milliseconds.
    #[must_use]
    pub fn finish(self) -> f64 {
        let duration_ms = self.elapsed_ms();
        ::tracing::debug!(label = %self.label, duration_ms, "timed");
        duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailureReason, StageFailure};

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_stage_event_fields_for_failure() {
        let stage = StageSpec::new("contract", ["osrm-contract"]).with_outputs(["graph"]);
        let outcome = StageOutcome::Failed(StageFailure {
            reason: FailureReason::ExitStatus { code: Some(3) },
            exit_code: Some(3),
            tail: Vec::new(),
            left_behind: vec!["graph".into()],
            duration_ms: 5.0,
        });

        let json = StageEventFields::from_outcome(&stage, &outcome, 5.0).to_json();
        assert_eq!(json["stage"], "contract");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["exit_code"], 3);
        assert_eq!(json["reason"], "command exited with status 3");
    }

    #[test]
    fn test_stage_event_fields_omit_absent_failure() {
        let stage = StageSpec::new("extract", ["osrm-extract"]);
        let outcome = StageOutcome::Succeeded { duration_ms: 1.0 };
        let json = StageEventFields::from_outcome(&stage, &outcome, 1.0).to_json();
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("exit_code").is_none());
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("fetch:planet");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.finish() >= 10.0);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing("warn", LogFormat::Text);
        init_tracing("debug", LogFormat::Json);
    }
}
