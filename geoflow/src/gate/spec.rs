//! Service declarations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How readiness is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeSpec {
    /// `GET` the URL; any 2xx is ready.
    Http(String),
    /// Connect to `host:port`.
    Tcp(String),
    /// Run a command; exit 0 is ready.
    Command(Vec<String>),
}

impl ProbeSpec {
    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Http(url) => format!("http {url}"),
            Self::Tcp(address) => format!("tcp {address}"),
            Self::Command(argv) => format!("command {}", argv.join(" ")),
        }
    }
}

/// A long-running service brought up after its prerequisites are valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    /// Artifacts that must be valid before the service is started.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Command that starts the service (e.g. `docker compose up -d`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Vec<String>>,
    /// Readiness probe, written as a one-key map such as `http: <url>`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub probe: ProbeSpec,
    /// Readiness timeout; falls back to the pipeline default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ServiceSpec {
    /// Creates a service with no prerequisites and no start command.
    #[must_use]
    pub fn new(name: impl Into<String>, probe: ProbeSpec) -> Self {
        Self {
            name: name.into(),
            prerequisites: Vec::new(),
            start: None,
            probe,
            timeout_secs: None,
        }
    }

    /// Sets the prerequisite artifacts.
    #[must_use]
    pub fn with_prerequisites(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.prerequisites = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the start command.
    #[must_use]
    pub fn with_start<S: Into<String>>(mut self, argv: impl IntoIterator<Item = S>) -> Self {
        self.start = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the readiness timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Effective readiness timeout given the pipeline default.
    #[must_use]
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map_or(default, Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_spec_yaml() {
        let service: ServiceSpec = serde_yaml::from_str(
            "name: osrm\nprerequisites: [graph]\nstart: [docker, compose, up, -d]\nprobe:\n  http: http://localhost:5000/health\n",
        )
        .unwrap();
        assert_eq!(service.probe, ProbeSpec::Http("http://localhost:5000/health".into()));
        assert_eq!(service.start.as_ref().map(Vec::len), Some(4));

        let db: ServiceSpec =
            serde_yaml::from_str("name: db\nprobe:\n  tcp: localhost:5432\n").unwrap();
        assert_eq!(db.probe.describe(), "tcp localhost:5432");

        let check: ServiceSpec =
            serde_yaml::from_str("name: tiles\nprobe: { command: [pg_isready, -q] }\n").unwrap();
        assert_eq!(check.probe, ProbeSpec::Command(vec!["pg_isready".into(), "-q".into()]));
    }

    #[test]
    fn test_probe_round_trips_through_yaml() {
        let service = ServiceSpec::new("osrm", ProbeSpec::Http("http://localhost:5000/".into()));
        let yaml = serde_yaml::to_string(&service).unwrap();
        assert!(yaml.contains("http: http://localhost:5000/"));
        let back: ServiceSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, service);
    }

    #[test]
    fn test_timeout_override() {
        let service = ServiceSpec::new("db", ProbeSpec::Tcp("localhost:5432".into()));
        assert_eq!(service.timeout(Duration::from_secs(300)), Duration::from_secs(300));
        assert_eq!(
            service.with_timeout_secs(30).timeout(Duration::from_secs(300)),
            Duration::from_secs(30)
        );
    }
}
