//! The orchestrator: acquire → transform → load → serve.
//!
//! One run holds the data-directory lock for its whole duration, fetches
//! every source, executes the plan, reconciles every cache domain and then
//! gates every service that a stage did not already bring up. The report is
//! written to `<data_dir>/.geoflow/last-run.json`.

mod preflight;

use self::preflight::GatePreflight;
use crate::cache::{CacheInvalidator, ReconcileOutcome};
use crate::cancellation::CancellationToken;
use crate::config::Settings;
use crate::core::{
    Artifact, CacheAction, CacheRecord, FetchRecord, FetchStatus, RunRecorder, RunReport,
};
use crate::errors::{ErrorKind, GeoflowError, PipelineValidationError};
use crate::events::{names, EventSink, LoggingEventSink};
use crate::fetch::{ArtifactSource, FetchError, FetchOptions, Fetcher, SourceSpec, PART_SUFFIX};
use crate::gate::ReadinessGate;
use crate::pipeline::{Force, LoadedPipeline, Pipeline, PlanOutcome, Planner};
use crate::stages::{CommandRunner, Satisfaction, StageExecutor};
use crate::state::{DataDir, DataDirLock, StateStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Trigger recorded for the reconcile pass that precedes serving.
pub const PRE_SERVE: &str = "pre-serve";

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stages that run even when satisfied.
    pub force: Force,
    /// Readiness timeout for every service, overriding the definition.
    pub readiness_timeout: Option<Duration>,
}

/// Composes fetcher, planner, cache invalidator and readiness gate.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    data_dir: DataDir,
    settings: Settings,
    source: Arc<dyn ArtifactSource>,
    runner: Arc<dyn CommandRunner>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.pipeline.name())
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator that logs events and is never cancelled
    /// unless [`cancellation`](Self::cancellation) is triggered.
    #[must_use]
    pub fn new(
        loaded: LoadedPipeline,
        source: Arc<dyn ArtifactSource>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            pipeline: Arc::new(loaded.pipeline),
            data_dir: loaded.data_dir,
            settings: loaded.settings,
            source,
            runner,
            events: Arc::new(LoggingEventSink::default()),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that cancels this orchestrator's runs.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// The validated pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The data directory.
    #[must_use]
    pub const fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    /// Performs a full run and returns its report.
    ///
    /// Step failures are part of the report, not errors.
    ///
    /// # Errors
    ///
    /// Returns [`GeoflowError::Locked`] if another run holds the data
    /// directory, or a state error if the run state cannot be loaded.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport, GeoflowError> {
        let _lock = DataDirLock::acquire(&self.data_dir)?;
        let state = Arc::new(StateStore::load(self.data_dir.state_path())?);
        let mut recorder = RunRecorder::new(self.pipeline.name());
        let span = info_span!("run", pipeline = %self.pipeline.name(), run_id = %recorder.run_id());

        async {
            info!(data_dir = %self.data_dir.root().display(), "starting run");
            if self.fetch_sources(&mut recorder).await {
                self.build_and_serve(&state, options, &mut recorder).await;
            }
        }
        .instrument(span)
        .await;

        let report = recorder.finish();
        if let Err(e) = self.write_report(&report).await {
            warn!(error = %e, "could not write last-run report");
        }
        info!(status = ?report.status, elapsed_ms = report.elapsed_ms, "run finished");
        Ok(report)
    }

    /// Shows what a run would do without running anything.
    ///
    /// # Errors
    ///
    /// Returns a state error if the run state cannot be loaded.
    pub async fn plan(&self, force: Force) -> Result<Vec<(String, Satisfaction)>, GeoflowError> {
        let state = Arc::new(StateStore::load(self.data_dir.state_path())?);
        let executor = Arc::new(self.executor(state));
        let planner = Planner::new(Arc::clone(&self.pipeline), executor).with_force(force);
        Ok(planner.preview(&self.pipeline.plan()).await)
    }

    /// Clears cache domain `name` unconditionally.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown domain, [`GeoflowError::Locked`]
    /// while a run is active, or [`GeoflowError::CacheFailed`] if clearing fails.
    pub async fn invalidate(&self, name: &str) -> Result<CacheRecord, GeoflowError> {
        let Some(domain) = self.pipeline.cache_domain(name) else {
            return Err(PipelineValidationError::new(format!("Unknown cache domain '{name}'"))
                .with_subjects(vec![name.to_string()])
                .into());
        };
        let _lock = DataDirLock::acquire(&self.data_dir)?;
        let state = Arc::new(StateStore::load(self.data_dir.state_path())?);
        let invalidator = CacheInvalidator::new(state, Arc::clone(&self.events));
        invalidator
            .invalidate(domain, &self.pipeline.upstream_of(domain))
            .await?;
        Ok(CacheRecord {
            domain: domain.name.clone(),
            trigger: "operator".to_string(),
            action: CacheAction::Cleared,
        })
    }

    /// Fetches every source. Returns false if the run must stop.
    async fn fetch_sources(&self, recorder: &mut RunRecorder) -> bool {
        let fetcher = Fetcher::new(
            Arc::clone(&self.source),
            Arc::clone(&self.events),
            Arc::clone(&self.cancel),
        );
        let base = FetchOptions::from_settings(&self.settings.fetch);

        for source in self.pipeline.sources() {
            if self.cancel.is_cancelled() {
                recorder.mark_cancelled(self.cancel.reason_or_default());
                return false;
            }
            let Some(artifact) = self.pipeline.catalog().get(&source.artifact) else {
                continue;
            };

            let validity = artifact.validate().await;
            if validity.is_valid() {
                info!(artifact = %artifact.name, "source artifact already valid; not downloading");
                self.events
                    .emit(names::FETCH_SKIPPED, Some(json!({ "artifact": artifact.name })))
                    .await;
                recorder.record_fetch(FetchRecord {
                    artifact: artifact.name.clone(),
                    url: source.url.clone(),
                    outcome: FetchStatus::Skipped {
                        reason: "already valid".to_string(),
                    },
                });
                continue;
            }

            let options = base.clone().for_source(source);
            match fetcher.fetch(&source.url, artifact, &options).await {
                Ok(fetched) => recorder.record_fetch(FetchRecord {
                    artifact: artifact.name.clone(),
                    url: source.url.clone(),
                    outcome: FetchStatus::Downloaded {
                        bytes: fetched.bytes,
                        resumed_from: fetched.resumed_from,
                        duration_ms: fetched.duration_ms,
                    },
                }),
                Err(err) => {
                    self.record_fetch_failure(recorder, source, artifact, &err);
                    if let FetchError::Cancelled(reason) = err {
                        recorder.mark_cancelled(reason);
                    }
                    return false;
                }
            }
        }
        true
    }

    fn record_fetch_failure(
        &self,
        recorder: &mut RunRecorder,
        source: &SourceSpec,
        artifact: &Artifact,
        err: &FetchError,
    ) {
        let left = if matches!(err.kind(), ErrorKind::Cancelled) {
            format!("partial download kept at {}", artifact.sibling(PART_SUFFIX).display())
        } else if artifact.path.exists() {
            format!("existing {} left untouched", artifact.path.display())
        } else {
            format!("{} not written", artifact.path.display())
        };
        warn!(artifact = %artifact.name, url = %source.url, error = %err, "fetch failed");
        recorder.record_fetch(FetchRecord {
            artifact: artifact.name.clone(),
            url: source.url.clone(),
            outcome: FetchStatus::Failed {
                kind: err.kind(),
                message: format!("{err}; {left}"),
            },
        });
    }

    async fn build_and_serve(
        &self,
        state: &Arc<StateStore>,
        options: &RunOptions,
        recorder: &mut RunRecorder,
    ) {
        let gate = Arc::new(
            ReadinessGate::new(
                Arc::clone(self.pipeline.catalog()),
                self.data_dir.clone(),
                Arc::clone(&self.runner),
                Arc::clone(&self.events),
                Arc::clone(&self.cancel),
            )
            .with_interval(self.settings.probe_interval())
            .with_attempt_timeout(self.settings.probe_attempt_timeout()),
        );
        let preflight = Arc::new(GatePreflight::new(
            Arc::clone(&self.pipeline),
            gate,
            self.settings.readiness_timeout(),
            options.readiness_timeout,
        ));
        let invalidator = Arc::new(CacheInvalidator::new(
            Arc::clone(state),
            Arc::clone(&self.events),
        ));
        let planner = Planner::new(
            Arc::clone(&self.pipeline),
            Arc::new(self.executor(Arc::clone(state))),
        )
        .with_invalidator(Arc::clone(&invalidator))
        .with_preflight(preflight.clone())
        .with_force(options.force.clone());

        let outcome = planner.execute(&self.pipeline.plan(), recorder).await;
        for record in preflight.take_records() {
            recorder.record_service(record);
        }
        if outcome != PlanOutcome::Completed {
            return;
        }

        if !self.reconcile_all(&invalidator, recorder).await {
            return;
        }

        for service in self.pipeline.services() {
            if preflight.is_ready(&service.name) {
                continue;
            }
            if self.cancel.is_cancelled() {
                recorder.mark_cancelled(self.cancel.reason_or_default());
                break;
            }
            preflight.ensure(service).await;
            for record in preflight.take_records() {
                recorder.record_service(record);
            }
        }
    }

    /// Reconciles every cache domain before serving. Returns false on failure.
    async fn reconcile_all(&self, invalidator: &CacheInvalidator, recorder: &mut RunRecorder) -> bool {
        for domain in self.pipeline.cache_domains() {
            let upstream = self.pipeline.upstream_of(domain);
            let action = match invalidator.reconcile(domain, &upstream).await {
                Ok(ReconcileOutcome::Cleared) => CacheAction::Cleared,
                Ok(ReconcileOutcome::Fresh) => continue,
                Err(e) => CacheAction::Failed { message: e.to_string() },
            };
            let failed = matches!(action, CacheAction::Failed { .. });
            recorder.record_cache(CacheRecord {
                domain: domain.name.clone(),
                trigger: PRE_SERVE.to_string(),
                action,
            });
            if failed {
                return false;
            }
        }
        true
    }

    fn executor(&self, state: Arc<StateStore>) -> StageExecutor {
        StageExecutor::new(
            Arc::clone(self.pipeline.catalog()),
            self.data_dir.clone(),
            state,
            Arc::clone(&self.runner),
            Arc::clone(&self.events),
            Arc::clone(&self.cancel),
        )
        .with_default_timeout_secs(self.settings.stage_timeout_secs)
        .with_tail_lines(self.settings.tail_lines)
    }

    async fn write_report(&self, report: &RunReport) -> Result<(), GeoflowError> {
        let path = self.data_dir.last_run_path();
        let tmp = crate::core::sibling_path(&path, ".tmp");
        let json = report.to_json().map_err(|e| GeoflowError::State {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunStatus, StageStatus};
    use crate::events::CollectingEventSink;
    use crate::exit_codes;
    use crate::pipeline::PipelineDefinition;
    use crate::testing::{MemorySource, Script, ScriptedRunner};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const DEFINITION: &str = r#"
pipeline: tiles
settings:
  probe_interval_ms: 10
  readiness_timeout_secs: 1
  fetch:
    max_attempts: 2
    base_delay_ms: 1
artifacts:
  - name: raw
    path: region.osm.pbf
  - name: graph
    path: region.osrm
  - name: imported
    path: import.done
sources:
  - artifact: raw
    url: mem://region.osm.pbf
stages:
  - name: extract
    command: [osrm-extract, "{raw}", "{graph}"]
    inputs: [raw]
    outputs: [graph]
  - name: import
    command: [osm2pgsql, "{raw}", "{imported}"]
    inputs: [raw]
    outputs: [imported]
    services: [db]
cache_domains:
  - name: routes
    path: cache/routes
    upstream: [graph]
services:
  - name: db
    start: [db-up]
    probe:
      command: [db-check]
  - name: routing
    prerequisites: [graph]
    start: [osrm-routed, "{graph}"]
    probe:
      command: [routing-check]
"#;

    fn loaded(root: &Path) -> LoadedPipeline {
        PipelineDefinition::from_yaml_str(DEFINITION)
            .unwrap()
            .into_pipeline(Some(root))
            .unwrap()
    }

    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("extract", Script::success().write_arg(1, 64))
            .on("import", Script::success().write_arg(1, 4))
    }

    fn orchestrator(root: &Path, source: MemorySource, runner: &Arc<ScriptedRunner>) -> Orchestrator {
        Orchestrator::new(loaded(root), Arc::new(source), runner.clone())
            .with_events(Arc::new(CollectingEventSink::new()))
    }

    #[tokio::test]
    async fn test_full_run_then_idempotent_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner());
        let orch = orchestrator(dir.path(), MemorySource::new(vec![1u8; 10_000]), &runner);

        let report = orch.run(&RunOptions::default()).await.unwrap();
        assert!(report.is_success(), "{}", report.render_summary());
        assert!(matches!(report.fetches[0].outcome, FetchStatus::Downloaded { bytes: 10_000, .. }));
        assert_eq!(
            runner.labels(),
            vec!["extract", "db.start", "db.probe", "import", "routing.start", "routing.probe"]
        );
        assert_eq!(report.services.len(), 2);
        assert_eq!(report.caches[0].trigger, "extract");
        assert!(dir.path().join(".geoflow/last-run.json").exists());

        runner.clear_calls();
        let again = orch.run(&RunOptions::default()).await.unwrap();
        assert!(again.is_success());
        assert!(matches!(again.fetches[0].outcome, FetchStatus::Skipped { .. }));
        assert!(again.stages.iter().all(|s| s.status() == StageStatus::Skipped));
        assert!(again.caches.is_empty());
        assert!(!runner.labels().iter().any(|l| l == "extract" || l == "import"));
    }

    #[tokio::test]
    async fn test_fetch_failure_halts_before_stages() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner());
        let orch = orchestrator(
            dir.path(),
            MemorySource::new(vec![1u8; 100]).fail_every_open(),
            &runner,
        );

        let report = orch.run(&RunOptions::default()).await.unwrap();
        assert_eq!(report.exit_code(), exit_codes::FETCH_FAILED);
        assert!(report.stages.is_empty());
        assert!(runner.calls().is_empty());
        match &report.fetches[0].outcome {
            FetchStatus::Failed { message, .. } => assert!(message.contains("not written")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stage_failure_skips_services() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("extract", Script::exit(2)));
        let orch = orchestrator(dir.path(), MemorySource::new(vec![1u8; 100]), &runner);

        let report = orch.run(&RunOptions::default()).await.unwrap();
        assert_eq!(report.exit_code(), exit_codes::STAGE_FAILED);
        assert!(report.services.is_empty());
        assert_eq!(runner.labels(), vec!["extract"]);
    }

    #[tokio::test]
    async fn test_preflight_failure_fails_import() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner().on("db.start", Script::exit(1)));
        let orch = orchestrator(dir.path(), MemorySource::new(vec![1u8; 100]), &runner);

        let report = orch.run(&RunOptions::default()).await.unwrap();
        match &report.status {
            RunStatus::Failed { subject, .. } => assert_eq!(subject, "import"),
            RunStatus::Succeeded => panic!("expected failure"),
        }
        assert!(!report.service("db").unwrap().outcome.is_ready());
        assert_eq!(runner.call_count("import"), 0);
    }

    #[tokio::test]
    async fn test_service_timeout_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner().on("routing.probe", Script::exit(1)));
        let orch = orchestrator(dir.path(), MemorySource::new(vec![1u8; 100]), &runner);

        let options = RunOptions {
            readiness_timeout: Some(Duration::from_millis(60)),
            ..RunOptions::default()
        };
        let report = orch.run(&options).await.unwrap();
        assert_eq!(report.exit_code(), exit_codes::READINESS_TIMEOUT);
        assert!(report.service("db").unwrap().outcome.is_ready());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner());
        let orch = orchestrator(dir.path(), MemorySource::new(vec![1u8; 100]), &runner);

        let _held = DataDirLock::acquire(orch.data_dir()).unwrap();
        let err = orch.run(&RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, GeoflowError::Locked { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner());
        let orch = orchestrator(dir.path(), MemorySource::new(vec![1u8; 100]), &runner);
        orch.cancellation().cancel("interrupted");

        let report = orch.run(&RunOptions::default()).await.unwrap();
        assert_eq!(report.exit_code(), exit_codes::CANCELLED);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_and_plan() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner());
        let orch = orchestrator(dir.path(), MemorySource::new(vec![1u8; 100]), &runner);

        let preview = orch.plan(Force::None).await.unwrap();
        assert_eq!(preview.len(), 2);
        assert!(runner.calls().is_empty());

        orch.run(&RunOptions::default()).await.unwrap();
        let cached = dir.path().join("cache/routes/route.bin");
        std::fs::write(&cached, b"x").unwrap();

        let record = orch.invalidate("routes").await.unwrap();
        assert_eq!(record.action, CacheAction::Cleared);
        assert!(!cached.exists());
        assert!(dir.path().join("cache/routes").is_dir());

        let err = orch.invalidate("nope").await.unwrap_err();
        assert!(matches!(err, GeoflowError::Validation(_)));
    }

    #[test]
    fn test_run_options_default() {
        let options = RunOptions::default();
        assert_eq!(options.force, Force::None);
        assert!(options.readiness_timeout.is_none());
        assert_eq!(Settings::default().readiness_timeout_secs, 300);
    }
}
