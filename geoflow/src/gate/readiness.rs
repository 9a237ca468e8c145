//! The readiness gate: verify prerequisites, start, poll until ready.

use super::probe::{build_probe, Probe};
use super::{GateOutcome, ProbeSpec, ServiceSpec};
use crate::cancellation::CancellationToken;
use crate::core::ArtifactCatalog;
use crate::events::{names, EventSink};
use crate::stages::{render, CommandRunner, CommandSpec, TemplateContext};
use crate::state::DataDir;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Starts services and waits for them to become ready.
pub struct ReadinessGate {
    catalog: Arc<ArtifactCatalog>,
    data_dir: DataDir,
    runner: Arc<dyn CommandRunner>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    interval: Duration,
    attempt_timeout: Duration,
    start_timeout: Duration,
}

impl std::fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("interval", &self.interval)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl ReadinessGate {
    /// Creates a gate with a 3 s poll interval and 10 s attempt timeout.
    #[must_use]
    pub fn new(
        catalog: Arc<ArtifactCatalog>,
        data_dir: DataDir,
        runner: Arc<dyn CommandRunner>,
        events: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            catalog,
            data_dir,
            runner,
            events,
            cancel,
            interval: Duration::from_secs(3),
            attempt_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(600),
        }
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the timeout of a single probe attempt.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Sets the timeout of the start command.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Brings `service` up and waits until its probe passes or `timeout`
    /// elapses.
    pub async fn await_ready(&self, service: &ServiceSpec, timeout: Duration) -> GateOutcome {
        if let Some(outcome) = self.check_prerequisites(service).await {
            return self.finish(service, outcome).await;
        }

        let probe_spec = match &service.probe {
            ProbeSpec::Command(argv) => match render(argv, &self.template_context(service)) {
                Ok(argv) => ProbeSpec::Command(argv),
                Err(e) => {
                    let outcome = GateOutcome::ProbeError { message: e.to_string() };
                    return self.finish(service, outcome).await;
                }
            },
            other => other.clone(),
        };
        let probe = match build_probe(
            &service.name,
            &probe_spec,
            self.attempt_timeout,
            &self.runner,
            &self.cancel,
        ) {
            Ok(probe) => probe,
            Err(e) => {
                let outcome = GateOutcome::ProbeError { message: e.to_string() };
                return self.finish(service, outcome).await;
            }
        };

        if let Some(outcome) = self.start(service).await {
            return self.finish(service, outcome).await;
        }

        let outcome = self.poll(service, probe.as_ref(), timeout).await;
        self.finish(service, outcome).await
    }

    /// Like [`await_ready`](Self::await_ready) but with an explicit probe.
    pub async fn await_ready_with(
        &self,
        service: &ServiceSpec,
        probe: &dyn Probe,
        timeout: Duration,
    ) -> GateOutcome {
        if let Some(outcome) = self.check_prerequisites(service).await {
            return self.finish(service, outcome).await;
        }
        if let Some(outcome) = self.start(service).await {
            return self.finish(service, outcome).await;
        }
        let outcome = self.poll(service, probe, timeout).await;
        self.finish(service, outcome).await
    }

    async fn check_prerequisites(&self, service: &ServiceSpec) -> Option<GateOutcome> {
        let mut missing = Vec::new();
        for name in &service.prerequisites {
            match self.catalog.get(name) {
                Some(artifact) => {
                    let validity = artifact.validate().await;
                    if !validity.is_valid() {
                        missing.push(format!("{name}: {}", validity.describe()));
                    }
                }
                None => missing.push(format!("{name}: not declared")),
            }
        }
        if missing.is_empty() {
            None
        } else {
            Some(GateOutcome::PrerequisitesMissing { missing })
        }
    }

    fn template_context(&self, service: &ServiceSpec) -> TemplateContext {
        self.catalog
            .select(&service.prerequisites)
            .fold(TemplateContext::new(self.data_dir.root()), |ctx, artifact| {
                ctx.with_artifact(&artifact.name, &artifact.path)
            })
    }

    async fn start(&self, service: &ServiceSpec) -> Option<GateOutcome> {
        let template = service.start.as_ref()?;
        let argv = match render(template, &self.template_context(service)) {
            Ok(argv) => argv,
            Err(e) => {
                return Some(GateOutcome::StartFailed {
                    message: format!("start command template error: {e}"),
                    tail: Vec::new(),
                })
            }
        };
        let Some(mut command) = CommandSpec::from_argv(format!("{}.start", service.name), argv) else {
            return Some(GateOutcome::StartFailed {
                message: "start command is empty".to_string(),
                tail: Vec::new(),
            });
        };
        command.workdir = Some(self.data_dir.root().to_path_buf());
        command.timeout = Some(self.start_timeout);
        command.log_path = Some(self.data_dir.stage_log_path(&format!("service-{}", service.name)));

        info!(service = %service.name, command = %command.display(), "starting service");
        match self.runner.run(&command, &self.cancel).await {
            Ok(result) if result.exit.success() => None,
            Ok(result) => Some(GateOutcome::StartFailed {
                message: format!("{} ended with {:?}", command.display(), result.exit),
                tail: result.tail,
            }),
            Err(e) => Some(GateOutcome::StartFailed {
                message: format!("could not run {}: {e}", command.program),
                tail: Vec::new(),
            }),
        }
    }

    async fn poll(&self, service: &ServiceSpec, probe: &dyn Probe, timeout: Duration) -> GateOutcome {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return GateOutcome::Cancelled { reason: self.cancel.reason_or_default() };
                }
                result = tokio::time::timeout(self.attempt_timeout, probe.check()) => result,
            };
            let last_error = match result {
                Ok(Ok(())) => {
                    return GateOutcome::Ready {
                        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                        attempts,
                    };
                }
                Ok(Err(reason)) => reason,
                Err(_) => format!("probe attempt timed out after {:?}", self.attempt_timeout),
            };

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return GateOutcome::TimedOut {
                    elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                    attempts,
                    last_error,
                };
            }

            debug!(service = %service.name, attempts, error = %last_error, "not ready yet");
            self.events.try_emit(
                names::SERVICE_WAITING,
                Some(json!({
                    "service": service.name,
                    "attempt": attempts,
                    "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
                    "error": last_error,
                })),
            );

            let pause = self.interval.min(timeout.saturating_sub(elapsed));
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return GateOutcome::Cancelled { reason: self.cancel.reason_or_default() };
                }
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn finish(&self, service: &ServiceSpec, outcome: GateOutcome) -> GateOutcome {
        let data = serde_json::to_value(&outcome).ok().map(|mut value| {
            value["service"] = json!(service.name);
            value
        });
        if outcome.is_ready() {
            info!(service = %service.name, %outcome, "service ready");
            self.events.emit(names::SERVICE_READY, data).await;
        } else {
            warn!(service = %service.name, %outcome, "service not ready");
            self.events.emit(names::SERVICE_FAILED, data).await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Artifact;
    use crate::events::CollectingEventSink;
    use crate::gate::{MockProbe, ProbeSpec};
    use crate::testing::{Script, ScriptedRunner};
    use std::path::Path;

    fn gate(root: &Path, runner: Arc<ScriptedRunner>, events: Arc<CollectingEventSink>) -> ReadinessGate {
        let catalog: ArtifactCatalog = [Artifact::new("graph", root.join("graph.bin"))]
            .into_iter()
            .collect();
        ReadinessGate::new(
            Arc::new(catalog),
            DataDir::new(root),
            runner,
            events,
            Arc::new(CancellationToken::new()),
        )
        .with_interval(Duration::from_millis(10))
        .with_attempt_timeout(Duration::from_millis(200))
    }

    fn osrm() -> ServiceSpec {
        ServiceSpec::new("osrm", ProbeSpec::Http("http://127.0.0.1:1/health".into()))
            .with_prerequisites(["graph"])
            .with_start(["docker", "compose", "up", "-d", "osrm"])
    }

    #[tokio::test]
    async fn test_missing_prerequisites_never_probe() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let gate = gate(dir.path(), Arc::clone(&runner), Arc::new(CollectingEventSink::new()));

        let mut probe = MockProbe::new();
        probe.expect_check().never();

        let outcome = gate.await_ready_with(&osrm(), &probe, Duration::from_secs(1)).await;
        match outcome {
            GateOutcome::PrerequisitesMissing { missing } => {
                assert_eq!(missing, vec!["graph: missing".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ready_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("graph.bin"), b"graph").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let events = Arc::new(CollectingEventSink::new());
        let gate = gate(dir.path(), Arc::clone(&runner), Arc::clone(&events));

        let mut probe = MockProbe::new();
        let mut seq = mockall::Sequence::new();
        probe
            .expect_check()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Err("connection refused".to_string()));
        probe
            .expect_check()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let outcome = gate.await_ready_with(&osrm(), &probe, Duration::from_secs(5)).await;
        assert!(matches!(outcome, GateOutcome::Ready { attempts: 3, .. }), "{outcome:?}");
        assert_eq!(runner.labels(), vec!["osrm.start".to_string()]);
        assert_eq!(events.events_of_type("service.waiting").len(), 2);
        assert_eq!(events.events_of_type("service.ready").len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_last_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("graph.bin"), b"graph").unwrap();
        let gate = gate(
            dir.path(),
            Arc::new(ScriptedRunner::new()),
            Arc::new(CollectingEventSink::new()),
        );

        let mut probe = MockProbe::new();
        probe
            .expect_check()
            .returning(|| Err("HTTP 503 Service Unavailable".to_string()));

        let outcome = gate
            .await_ready_with(&osrm(), &probe, Duration::from_millis(50))
            .await;
        match outcome {
            GateOutcome::TimedOut {
                last_error,
                elapsed_ms,
                attempts,
            } => {
                assert!(last_error.contains("503"));
                assert!(elapsed_ms >= 50.0);
                assert!(attempts >= 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("graph.bin"), b"graph").unwrap();
        let runner = Arc::new(
            ScriptedRunner::new().on("osrm.start", Script::exit(1).print("no such service: osrm")),
        );
        let gate = gate(dir.path(), runner, Arc::new(CollectingEventSink::new()));

        let mut probe = MockProbe::new();
        probe.expect_check().never();

        let outcome = gate.await_ready_with(&osrm(), &probe, Duration::from_secs(1)).await;
        match outcome {
            GateOutcome::StartFailed { tail, .. } => {
                assert_eq!(tail, vec!["no such service: osrm".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_misconfiguration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("graph.bin"), b"graph").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let gate = gate(dir.path(), Arc::clone(&runner), Arc::new(CollectingEventSink::new()));

        let service = ServiceSpec::new("db", ProbeSpec::Tcp("localhost".into()))
            .with_prerequisites(["graph"])
            .with_start(["docker", "compose", "up", "-d", "db"]);
        let outcome = gate.await_ready(&service, Duration::from_secs(1)).await;
        assert!(matches!(outcome, GateOutcome::ProbeError { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_command_probe_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("db.probe", Script::exit(2))
                .on("db.probe", Script::success()),
        );
        let gate = gate(dir.path(), Arc::clone(&runner), Arc::new(CollectingEventSink::new()));

        let service = ServiceSpec::new("db", ProbeSpec::Command(vec!["pg_isready".into()]));
        let outcome = gate.await_ready(&service, Duration::from_secs(5)).await;
        assert!(matches!(outcome, GateOutcome::Ready { attempts: 2, .. }), "{outcome:?}");
        assert_eq!(runner.call_count("db.probe"), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = Arc::new(CancellationToken::new());
        let gate = ReadinessGate::new(
            Arc::new(ArtifactCatalog::new()),
            DataDir::new(dir.path()),
            Arc::new(ScriptedRunner::new()),
            Arc::new(CollectingEventSink::new()),
            Arc::clone(&cancel),
        )
        .with_interval(Duration::from_secs(60));

        let mut probe = MockProbe::new();
        probe.expect_check().returning(|| Err("refused".to_string()));

        let trigger = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel("interrupted");
        });
        let service = ServiceSpec::new("db", ProbeSpec::Tcp("localhost:5432".into()));
        let outcome = gate
            .await_ready_with(&service, &probe, Duration::from_secs(600))
            .await;
        assert_eq!(
            outcome,
            GateOutcome::Cancelled {
                reason: "interrupted".into()
            }
        );
    }
}
