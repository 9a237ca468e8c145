//! Bounded retry with backoff and jitter.
//!
//! The fetcher retries transient transfer errors with this. Whether an
//! error is worth retrying is the caller's decision.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base * 2^n
    #[default]
    Exponential,
    /// base * (n + 1)
    Linear,
    /// base
    Constant,
}

/// Randomization applied to each delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    None,
    /// Uniform in `0..=delay`.
    Full,
    /// Half the delay plus uniform in `0..=delay/2`.
    #[default]
    Equal,
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Equal,
        }
    }
}

impl RetryConfig {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Delay before retry number `retry` (0 for the first retry), without jitter.
    #[must_use]
    pub fn backoff(&self, retry: usize) -> Duration {
        let base = self.base_delay_ms;
        let ms = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                let exp = u32::try_from(retry).unwrap_or(u32::MAX).min(63);
                base.saturating_mul(1u64 << exp)
            }
            BackoffStrategy::Linear => {
                base.saturating_mul(u64::try_from(retry).unwrap_or(u64::MAX).saturating_add(1))
            }
            BackoffStrategy::Constant => base,
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Delay before retry number `retry`, with jitter applied.
    #[must_use]
    pub fn delay(&self, retry: usize) -> Duration {
        let ms = u64::try_from(self.backoff(retry).as_millis()).unwrap_or(u64::MAX);
        let jittered = match self.jitter_strategy {
            JitterStrategy::None => ms,
            JitterStrategy::Full if ms == 0 => 0,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=ms),
            JitterStrategy::Equal => {
                let half = ms / 2;
                half + rand::thread_rng().gen_range(0..=ms - half)
            }
        };
        Duration::from_millis(jittered)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent.
///
/// `on_retry` is called before each backoff sleep with the number of the
/// upcoming attempt, the delay and the error that caused it.
pub async fn with_retry<T, E, F, Fut, R, N>(
    config: &RetryConfig,
    key: &str,
    mut operation: F,
    is_retryable: R,
    mut on_retry: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
    N: FnMut(usize, Duration, &E),
{
    let budget = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) || attempt >= budget => return Err(e),
            Err(e) => {
                let delay = config.delay(attempt - 1);
                attempt += 1;
                tracing::debug!(
                    key,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "retrying after transient error"
                );
                on_retry(attempt, delay, &e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plain(backoff: BackoffStrategy) -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1_000)
            .with_backoff(backoff)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_backoff_growth() {
        let exp = plain(BackoffStrategy::Exponential);
        assert_eq!(exp.delay(0), Duration::from_millis(100));
        assert_eq!(exp.delay(2), Duration::from_millis(400));
        assert_eq!(exp.delay(10), Duration::from_millis(1_000));
        assert_eq!(exp.delay(usize::MAX), Duration::from_millis(1_000));

        let linear = plain(BackoffStrategy::Linear);
        assert_eq!(linear.delay(2), Duration::from_millis(300));

        let constant = plain(BackoffStrategy::Constant);
        assert_eq!(constant.delay(7), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let equal = plain(BackoffStrategy::Constant).with_jitter(JitterStrategy::Equal);
        let full = plain(BackoffStrategy::Constant).with_jitter(JitterStrategy::Full);
        for _ in 0..50 {
            let d = equal.delay(0).as_millis();
            assert!((50..=100).contains(&d), "{d}");
            assert!(full.delay(0).as_millis() <= 100);
        }
    }

    #[test]
    fn test_config_yaml() {
        let config: RetryConfig = serde_yaml::from_str(
            "max_attempts: 2\nbase_delay_ms: 10\nmax_delay_ms: 20\nbackoff_strategy: linear\njitter_strategy: none\n",
        )
        .unwrap();
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
    }

    fn fast(attempts: usize) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let mut retries = Vec::new();
        let result: Result<u32, String> = with_retry(
            &fast(5),
            "test",
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err(format!("reset {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
            |attempt, _, _| retries.push(attempt),
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(retries, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let mut calls = 0;
        let result: Result<(), String> = with_retry(
            &fast(3),
            "test",
            || {
                calls += 1;
                async { Err("timeout".to_string()) }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let mut calls = 0;
        let result: Result<(), String> = with_retry(
            &fast(5),
            "test",
            || {
                calls += 1;
                async { Err("404".to_string()) }
            },
            |e: &String| e != "404",
            |_, _, _| {},
        )
        .await;
        assert_eq!(result, Err("404".to_string()));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _: Result<(), String> = with_retry(
            &fast(0),
            "test",
            || {
                calls += 1;
                async { Err("x".to_string()) }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert_eq!(calls, 1);
    }
}
