//! Readiness probes.

use super::ProbeSpec;
use crate::cancellation::CancellationToken;
use crate::stages::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a probe could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProbeConfigError(pub String);

/// A single readiness check.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Probe: Send + Sync {
    /// Checks once. `Err` carries the reason the service is not ready.
    async fn check(&self) -> Result<(), String>;
}

/// `GET` a URL; any 2xx status is ready.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpProbe {
    /// Builds a probe for `url`.
    pub fn new(url: &str, attempt_timeout: Duration) -> Result<Self, ProbeConfigError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| ProbeConfigError(format!("invalid probe URL '{url}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProbeConfigError(format!(
                "unsupported probe URL scheme '{}'",
                url.scheme()
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .map_err(|e| ProbeConfigError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<(), String> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {status}"))
        }
    }
}

/// Connects to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
}

impl TcpProbe {
    /// Builds a probe for `address`, which must look like `host:port`.
    pub fn new(address: &str) -> Result<Self, ProbeConfigError> {
        let invalid = || ProbeConfigError(format!("invalid probe address '{address}', expected host:port"));
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> Result<(), String> {
        tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map(drop)
            .map_err(|e| e.to_string())
    }
}

/// Runs a command; exit 0 is ready.
pub struct CommandProbe {
    spec: CommandSpec,
    runner: Arc<dyn CommandRunner>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for CommandProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProbe").field("spec", &self.spec).finish_non_exhaustive()
    }
}

impl CommandProbe {
    /// Builds a probe running `argv`.
    pub fn new(
        label: impl Into<String>,
        argv: &[String],
        attempt_timeout: Duration,
        runner: Arc<dyn CommandRunner>,
        cancel: Arc<CancellationToken>,
    ) -> Result<Self, ProbeConfigError> {
        let mut spec = CommandSpec::from_argv(label, argv.to_vec())
            .ok_or_else(|| ProbeConfigError("probe command is empty".to_string()))?;
        spec.timeout = Some(attempt_timeout);
        spec.tail_lines = 5;
        Ok(Self { spec, runner, cancel })
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn check(&self) -> Result<(), String> {
        let result = self
            .runner
            .run(&self.spec, &self.cancel)
            .await
            .map_err(|e| e.to_string())?;
        if result.exit.success() {
            return Ok(());
        }
        let last = result.tail.last().cloned().unwrap_or_default();
        Err(format!("probe command ended with {:?} {last}", result.exit)
            .trim_end()
            .to_string())
    }
}

/// Builds the probe a service declares.
///
/// # Errors
///
/// Returns [`ProbeConfigError`] for an unparsable URL or address, or an
/// empty command.
pub fn build_probe(
    service: &str,
    spec: &ProbeSpec,
    attempt_timeout: Duration,
    runner: &Arc<dyn CommandRunner>,
    cancel: &Arc<CancellationToken>,
) -> Result<Box<dyn Probe>, ProbeConfigError> {
    Ok(match spec {
        ProbeSpec::Http(url) => Box::new(HttpProbe::new(url, attempt_timeout)?),
        ProbeSpec::Tcp(address) => Box::new(TcpProbe::new(address)?),
        ProbeSpec::Command(argv) => Box::new(CommandProbe::new(
            format!("{service}.probe"),
            argv,
            attempt_timeout,
            Arc::clone(runner),
            Arc::clone(cancel),
        )?),
    })
}
