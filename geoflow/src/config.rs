//! Run-wide settings: timeouts, polling intervals and fetch retry policy.
//!
//! Every field has a serde default so a pipeline definition only needs to
//! name what it overrides.

use crate::pipeline::{BackoffStrategy, JitterStrategy, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the artifact fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSettings {
    /// Total attempts per download, including the first.
    pub max_attempts: usize,
    /// Base backoff delay between attempts.
    pub base_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// How the delay grows between attempts.
    pub backoff: BackoffStrategy,
    /// Randomization applied to each delay.
    pub jitter: JitterStrategy,
    /// Abort an attempt when no bytes arrive for this long.
    pub stall_timeout_secs: u64,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
    /// Minimum wall time between progress reports.
    pub progress_interval_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Equal,
            stall_timeout_secs: 60,
            connect_timeout_secs: 30,
            progress_interval_ms: 1_500,
        }
    }
}

impl FetchSettings {
    /// Retry policy for transient transfer errors.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts.max(1))
            .with_base_delay_ms(self.base_delay_ms)
            .with_max_delay_ms(self.max_delay_ms)
            .with_backoff(self.backoff)
            .with_jitter(self.jitter)
    }

    /// Stall timeout as a duration.
    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// Connect timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Progress interval as a duration.
    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Run-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Default stage wall-clock timeout; `None` means unbounded.
    pub stage_timeout_secs: Option<u64>,
    /// Default readiness timeout per service.
    pub readiness_timeout_secs: u64,
    /// Interval between readiness probes.
    pub probe_interval_ms: u64,
    /// Timeout for a single probe attempt.
    pub probe_attempt_timeout_secs: u64,
    /// Lines of tool output kept in memory for failure diagnostics.
    pub tail_lines: usize,
    /// Fetcher settings.
    pub fetch: FetchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stage_timeout_secs: None,
            readiness_timeout_secs: 300,
            probe_interval_ms: 3_000,
            probe_attempt_timeout_secs: 10,
            tail_lines: 40,
            fetch: FetchSettings::default(),
        }
    }
}

impl Settings {
    /// Default readiness timeout as a duration.
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Probe interval as a duration.
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Single probe attempt timeout as a duration.
    #[must_use]
    pub const fn probe_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_attempt_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.readiness_timeout(), Duration::from_secs(300));
        assert_eq!(settings.probe_interval(), Duration::from_secs(3));
        assert_eq!(settings.fetch.progress_interval(), Duration::from_millis(1500));
        assert!(settings.stage_timeout_secs.is_none());
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let settings: Settings =
            serde_yaml::from_str("readiness_timeout_secs: 60\nfetch:\n  max_attempts: 2\n").unwrap();
        assert_eq!(settings.readiness_timeout_secs, 60);
        assert_eq!(settings.fetch.max_attempts, 2);
        assert_eq!(settings.fetch.stall_timeout_secs, 60);
        assert_eq!(settings.tail_lines, 40);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_yaml::from_str::<Settings>("readiness_timeout: 60\n").is_err());
    }

    #[test]
    fn test_retry_config_from_fetch_settings() {
        let retry = FetchSettings::default().retry_config();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(retry.jitter_strategy, JitterStrategy::Equal);
    }

    #[test]
    fn test_retry_strategies_configurable() {
        let settings: Settings =
            serde_yaml::from_str("fetch:\n  backoff: linear\n  jitter: full\n  base_delay_ms: 500\n").unwrap();
        let retry = settings.fetch.retry_config();
        assert_eq!(retry.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(retry.jitter_strategy, JitterStrategy::Full);
        assert_eq!(retry.backoff(2), Duration::from_millis(1_500));

        let constant: Settings = serde_yaml::from_str("fetch:\n  backoff: constant\n  jitter: none\n").unwrap();
        let retry = constant.fetch.retry_config();
        assert_eq!(retry.delay(4), Duration::from_millis(1_000));
    }
}
