//! Runs one stage against its declared inputs and outputs.

use super::runner::{CommandExit, CommandRunner, CommandSpec};
use super::template::{render, TemplateContext};
use crate::cancellation::CancellationToken;
use crate::core::{Artifact, ArtifactCatalog, FailureReason, StageFailure, StageOutcome};
use crate::events::{names, EventSink};
use crate::observability::{SpanTimer, StageEventFields};
use crate::pipeline::StageSpec;
use crate::state::{DataDir, StateStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

const PARTIAL_SUFFIX: &str = ".partial";

/// Whether a stage's outputs can be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Satisfaction {
    /// Every output is valid and at least as new as every input.
    Satisfied,
    /// The stage must run.
    Unsatisfied {
        /// The first reason found.
        reason: String,
    },
}

impl Satisfaction {
    fn unsatisfied(reason: impl Into<String>) -> Self {
        Self::Unsatisfied {
            reason: reason.into(),
        }
    }

    /// Returns true if the stage can be skipped.
    #[must_use]
    pub const fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// Executes stages one at a time.
///
/// Artifact paths in the catalog are expected to be resolved already.
pub struct StageExecutor {
    catalog: Arc<ArtifactCatalog>,
    data_dir: DataDir,
    state: Arc<StateStore>,
    runner: Arc<dyn CommandRunner>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    default_timeout_secs: Option<u64>,
    tail_lines: usize,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("data_dir", &self.data_dir)
            .field("artifacts", &self.catalog.len())
            .field("default_timeout_secs", &self.default_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        catalog: Arc<ArtifactCatalog>,
        data_dir: DataDir,
        state: Arc<StateStore>,
        runner: Arc<dyn CommandRunner>,
        events: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            catalog,
            data_dir,
            state,
            runner,
            events,
            cancel,
            default_timeout_secs: None,
            tail_lines: 40,
        }
    }

    /// Sets the timeout used by stages that declare none.
    #[must_use]
    pub const fn with_default_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Sets how many output lines are kept for diagnostics.
    #[must_use]
    pub const fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }

    /// The artifact catalog.
    #[must_use]
    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    /// Decides whether `stage` can be skipped.
    pub async fn evaluate(&self, stage: &StageSpec) -> Satisfaction {
        let mut oldest_output: Option<(SystemTime, &str)> = None;
        for name in &stage.outputs {
            let Some(artifact) = self.catalog.get(name) else {
                return Satisfaction::unsatisfied(format!("output '{name}' is not declared"));
            };
            if self.state.is_unknown(&artifact.path) {
                return Satisfaction::unsatisfied(format!(
                    "output '{name}' was left behind by a failed run"
                ));
            }
            let validity = artifact.validate().await;
            let Some(meta) = validity.meta() else {
                return Satisfaction::unsatisfied(format!("output '{name}' is {}", validity.describe()));
            };
            if oldest_output.map_or(true, |(t, _)| meta.modified < t) {
                oldest_output = Some((meta.modified, name.as_str()));
            }
        }

        for name in &stage.inputs {
            let Some(artifact) = self.catalog.get(name) else {
                return Satisfaction::unsatisfied(format!("input '{name}' is not declared"));
            };
            let meta = match artifact.stat().await {
                Ok(Some(meta)) => meta,
                Ok(None) => return Satisfaction::unsatisfied(format!("input '{name}' is missing")),
                Err(e) => {
                    return Satisfaction::unsatisfied(format!("input '{name}' is unreadable: {e}"))
                }
            };
            if let Some((oldest, output)) = oldest_output {
                if oldest < meta.modified {
                    return Satisfaction::unsatisfied(format!(
                        "output '{output}' is older than input '{name}'"
                    ));
                }
            }
        }

        Satisfaction::Satisfied
    }

    /// The token that cancels running commands.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Runs `stage` unless it is satisfied and `force` is false.
    pub async fn run(&self, stage: &StageSpec, force: bool) -> StageOutcome {
        if !force {
            if let Some(skipped) = self.skip_if_satisfied(stage).await {
                return skipped;
            }
        }
        self.run_now(stage).await
    }

    /// Returns a skipped outcome if `stage` is satisfied.
    pub async fn skip_if_satisfied(&self, stage: &StageSpec) -> Option<StageOutcome> {
        if !self.evaluate(stage).await.is_satisfied() {
            return None;
        }
        info!(stage = %stage.name, "outputs valid and fresh; skipping");
        self.events
            .emit(names::STAGE_SKIPPED, Some(json!({ "stage": stage.name })))
            .await;
        Some(StageOutcome::Skipped {
            reason: "outputs valid and fresh".to_string(),
        })
    }

    /// Runs the stage command regardless of satisfaction.
    pub async fn run_now(&self, stage: &StageSpec) -> StageOutcome {
        let timer = SpanTimer::start(format!("stage.{}", stage.name));
        let outcome = self.execute(stage).await;
        let duration_ms = timer.finish();

        let fields = StageEventFields::from_outcome(stage, &outcome, duration_ms).to_json();
        match &outcome {
            StageOutcome::Failed(failure) => {
                warn!(stage = %stage.name, reason = %failure.reason, exit_code = ?failure.exit_code, "stage failed");
                self.events.emit(names::STAGE_FAILED, Some(fields)).await;
            }
            _ => {
                info!(stage = %stage.name, duration_ms, "stage succeeded");
                self.events.emit(names::STAGE_COMPLETED, Some(fields)).await;
            }
        }
        outcome
    }

    async fn execute(&self, stage: &StageSpec) -> StageOutcome {
        let inputs = match self.declared(&stage.inputs) {
            Ok(artifacts) => artifacts,
            Err(missing) => return refuse(FailureReason::InputsInvalid { artifacts: missing }),
        };
        let outputs = match self.declared(&stage.outputs) {
            Ok(artifacts) => artifacts,
            Err(missing) => return refuse(FailureReason::InvalidOutputs { artifacts: missing }),
        };

        let mut invalid = Vec::new();
        for artifact in &inputs {
            let validity = artifact.validate().await;
            if !validity.is_valid() {
                invalid.push(format!("{}: {}", artifact.name, validity.describe()));
            }
        }
        if !invalid.is_empty() {
            return refuse(FailureReason::InputsInvalid { artifacts: invalid });
        }

        if self.cancel.is_cancelled() {
            return refuse(FailureReason::Cancelled {
                reason: self.cancel.reason_or_default(),
            });
        }

        let mut ctx = TemplateContext::new(self.data_dir.root()).with_bindings(&stage.bindings);
        for artifact in &inputs {
            ctx = ctx.with_artifact(&artifact.name, &artifact.path);
        }
        for artifact in &outputs {
            ctx = ctx.with_artifact(&artifact.name, self.write_path(stage, artifact));
        }
        let argv = match render(&stage.command, &ctx) {
            Ok(argv) => argv,
            Err(e) => return refuse(FailureReason::Template { message: e.to_string() }),
        };
        let Some(mut command) = CommandSpec::from_argv(&stage.name, argv) else {
            return refuse(FailureReason::Template {
                message: "command is empty".to_string(),
            });
        };
        command.workdir = Some(
            stage
                .workdir
                .as_deref()
                .map_or_else(|| self.data_dir.root().to_path_buf(), |w| self.data_dir.resolve(w)),
        );
        command.env = stage.env.clone();
        command.timeout = stage.timeout(self.default_timeout_secs);
        command.log_path = Some(self.data_dir.stage_log_path(&stage.name));
        command.tail_lines = self.tail_lines;

        if stage.staged {
            for artifact in &outputs {
                let partial = artifact.sibling(PARTIAL_SUFFIX);
                if let Err(e) = remove_if_exists(&partial).await {
                    warn!(path = %partial.display(), error = %e, "could not remove stale partial output");
                }
            }
        }

        // Anything the command touches is suspect until it validates.
        for artifact in &outputs {
            if let Err(e) = self.state.mark_unknown(&artifact.path) {
                return refuse(FailureReason::State { message: e.to_string() });
            }
        }

        info!(stage = %stage.name, command = %command.display(), "starting stage");
        self.events
            .emit(
                names::STAGE_STARTED,
                Some(json!({
                    "stage": stage.name,
                    "duration_class": stage.duration,
                    "command": command.display(),
                })),
            )
            .await;

        let result = match self.runner.run(&command, &self.cancel).await {
            Ok(result) => result,
            Err(e) => {
                return StageOutcome::Failed(StageFailure {
                    reason: FailureReason::SpawnFailed { message: e.to_string() },
                    exit_code: None,
                    tail: Vec::new(),
                    left_behind: self.left_behind(stage, &outputs).await,
                    duration_ms: 0.0,
                })
            }
        };

        let reason = match result.exit {
            CommandExit::Exited(Some(0)) => None,
            CommandExit::Exited(code) => Some(FailureReason::ExitStatus { code }),
            CommandExit::TimedOut => Some(FailureReason::TimedOut {
                timeout_secs: command.timeout.map_or(0, |t| t.as_secs()),
            }),
            CommandExit::Cancelled => Some(FailureReason::Cancelled {
                reason: self.cancel.reason_or_default(),
            }),
        };
        let exit_code = match result.exit {
            CommandExit::Exited(code) => code,
            _ => None,
        };
        if let Some(reason) = reason {
            return StageOutcome::Failed(StageFailure {
                reason,
                exit_code,
                tail: result.tail,
                left_behind: self.left_behind(stage, &outputs).await,
                duration_ms: result.duration_ms,
            });
        }

        let invalid = self.settle_outputs(stage, &inputs, &outputs).await;
        if !invalid.is_empty() {
            return StageOutcome::Failed(StageFailure {
                reason: FailureReason::InvalidOutputs { artifacts: invalid },
                exit_code,
                tail: result.tail,
                left_behind: self.left_behind(stage, &outputs).await,
                duration_ms: result.duration_ms,
            });
        }

        for artifact in &outputs {
            if let Err(e) = self.state.clear_unknown(&artifact.path) {
                return StageOutcome::Failed(StageFailure {
                    reason: FailureReason::State { message: e.to_string() },
                    exit_code,
                    tail: result.tail,
                    left_behind: Vec::new(),
                    duration_ms: result.duration_ms,
                });
            }
        }

        StageOutcome::Succeeded {
            duration_ms: result.duration_ms,
        }
    }

    /// Validates outputs after a zero exit, promoting staged files into place.
    /// Returns descriptions of the invalid ones.
    async fn settle_outputs(
        &self,
        stage: &StageSpec,
        inputs: &[&Artifact],
        outputs: &[&Artifact],
    ) -> Vec<String> {
        let mut invalid = Vec::new();
        for artifact in outputs {
            let candidate = self.write_path(stage, artifact);
            let validity = artifact.validate_at(&candidate).await;
            if !validity.is_valid() {
                invalid.push(format!("{}: {}", artifact.name, validity.describe()));
            }
        }
        if !invalid.is_empty() {
            return invalid;
        }

        if stage.staged {
            for artifact in outputs {
                let partial = artifact.sibling(PARTIAL_SUFFIX);
                if let Err(e) = tokio::fs::rename(&partial, &artifact.path).await {
                    invalid.push(format!("{}: could not move into place ({e})", artifact.name));
                }
            }
            if !invalid.is_empty() {
                return invalid;
            }
        }

        let mut newest_input = None;
        for artifact in inputs {
            if let Ok(Some(meta)) = artifact.stat().await {
                newest_input = newest_input.max(Some(meta.modified));
            }
        }
        if let Some(newest_input) = newest_input {
            for artifact in outputs {
                if let Ok(Some(meta)) = artifact.stat().await {
                    if meta.modified < newest_input {
                        invalid.push(format!(
                            "{}: not rewritten by the command (older than its inputs)",
                            artifact.name
                        ));
                    }
                }
            }
        }
        invalid
    }

    fn declared<'a>(&'a self, names: &[String]) -> Result<Vec<&'a Artifact>, Vec<String>> {
        let mut found = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.catalog.get(name) {
                Some(artifact) => found.push(artifact),
                None => missing.push(format!("{name}: not declared")),
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(missing)
        }
    }

    fn write_path(&self, stage: &StageSpec, artifact: &Artifact) -> PathBuf {
        if stage.staged {
            artifact.sibling(PARTIAL_SUFFIX)
        } else {
            artifact.path.clone()
        }
    }

    async fn left_behind(&self, stage: &StageSpec, outputs: &[&Artifact]) -> Vec<String> {
        let mut left = Vec::new();
        for artifact in outputs {
            let path = self.write_path(stage, artifact);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                left.push(path.display().to_string());
            }
        }
        left
    }
}

fn refuse(reason: FailureReason) -> StageOutcome {
    StageOutcome::Failed(StageFailure::before_start(reason))
}

async fn remove_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
