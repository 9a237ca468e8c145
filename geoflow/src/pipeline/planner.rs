//! Sequential, fail-fast execution of a plan.

use super::{Pipeline, Plan, StageSpec};
use crate::cache::{CacheInvalidator, ReconcileOutcome};
use crate::core::{
    CacheAction, CacheRecord, FailureReason, RunRecorder, RunReport, StageFailure, StageOutcome,
    StageRecord,
};
use crate::stages::{Satisfaction, StageExecutor};
use crate::utils::iso_timestamp;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Which stages run even when satisfied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Force {
    /// Only unsatisfied stages run.
    #[default]
    None,
    /// Every stage runs.
    All,
    /// The named stages run.
    Stages(BTreeSet<String>),
}

impl Force {
    /// Builds a force set from CLI flags.
    #[must_use]
    pub fn from_flags(all: bool, stages: &[String]) -> Self {
        if all {
            Self::All
        } else if stages.is_empty() {
            Self::None
        } else {
            Self::Stages(stages.iter().cloned().collect())
        }
    }

    /// Returns true if `stage` is forced.
    #[must_use]
    pub fn applies_to(&self, stage: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Stages(names) => names.contains(stage),
        }
    }
}

/// Brings up the services a stage needs before its command runs.
#[async_trait]
pub trait StagePreflight: Send + Sync {
    /// Makes `services` ready for `stage`. `Err` describes why not.
    async fn prepare(&self, stage: &StageSpec, services: &[String]) -> Result<(), String>;
}

/// How a plan execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Every stage was skipped or succeeded.
    Completed,
    /// A stage failed; later stages were not attempted.
    StageFailed,
    /// A cache domain could not be cleared.
    CacheFailed,
    /// The run was cancelled.
    Cancelled,
}

/// Executes plans one stage at a time.
pub struct Planner {
    pipeline: Arc<Pipeline>,
    executor: Arc<StageExecutor>,
    invalidator: Option<Arc<CacheInvalidator>>,
    preflight: Option<Arc<dyn StagePreflight>>,
    force: Force,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("pipeline", &self.pipeline.name())
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl Planner {
    /// Creates a planner.
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, executor: Arc<StageExecutor>) -> Self {
        Self {
            pipeline,
            executor,
            invalidator: None,
            preflight: None,
            force: Force::None,
        }
    }

    /// Reconciles cache domains after stages that feed them.
    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Arc<CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Brings up services before stages that need them.
    #[must_use]
    pub fn with_preflight(mut self, preflight: Arc<dyn StagePreflight>) -> Self {
        self.preflight = Some(preflight);
        self
    }

    /// Sets the force set.
    #[must_use]
    pub fn with_force(mut self, force: Force) -> Self {
        self.force = force;
        self
    }

    /// Evaluates every stage without running anything.
    ///
    /// A stage whose upstream is going to run is reported as unsatisfied,
    /// since the rerun will leave its outputs older than their inputs.
    pub async fn preview(&self, plan: &Plan) -> Vec<(String, Satisfaction)> {
        let mut will_run = BTreeSet::new();
        let mut out = Vec::with_capacity(plan.len());
        for stage in plan.stages() {
            let upstream = self
                .pipeline
                .dependencies(stage)
                .into_iter()
                .find(|dep| will_run.contains(*dep));
            let satisfaction = if self.force.applies_to(&stage.name) {
                Satisfaction::Unsatisfied {
                    reason: "forced".to_string(),
                }
            } else if let Some(dep) = upstream {
                Satisfaction::Unsatisfied {
                    reason: format!("upstream stage '{dep}' will run"),
                }
            } else {
                self.executor.evaluate(stage).await
            };
            if !satisfaction.is_satisfied() {
                will_run.insert(stage.name.clone());
            }
            out.push((stage.name.clone(), satisfaction));
        }
        out
    }

    /// Executes `plan` and returns the finished report.
    pub async fn run(&self, plan: &Plan) -> RunReport {
        let mut recorder = RunRecorder::new(plan.pipeline());
        self.execute(plan, &mut recorder).await;
        recorder.finish()
    }

    /// Executes `plan`, recording every step into `recorder`.
    ///
    /// Stages run strictly in plan order. The first failed stage stops the
    /// run; later stages are never attempted.
    pub async fn execute(&self, plan: &Plan, recorder: &mut RunRecorder) -> PlanOutcome {
        let cancel = self.executor.cancellation();

        for stage in plan.stages() {
            if cancel.is_cancelled() {
                recorder.mark_cancelled(cancel.reason_or_default());
                return PlanOutcome::Cancelled;
            }

            let started_at = iso_timestamp();
            let outcome = self.run_stage(stage).await;
            let ran = outcome.ran();
            let failure_reason = outcome.failure().map(|f| f.reason.clone());
            recorder.record_stage(StageRecord {
                stage: stage.name.clone(),
                duration_class: stage.duration,
                started_at,
                outcome,
            });

            match failure_reason {
                Some(FailureReason::Cancelled { reason }) => {
                    recorder.mark_cancelled(reason);
                    return PlanOutcome::Cancelled;
                }
                Some(reason) => {
                    warn!(stage = %stage.name, %reason, "stopping at failed stage");
                    return PlanOutcome::StageFailed;
                }
                None => {}
            }

            if ran && !self.reconcile_after(stage, recorder).await {
                return PlanOutcome::CacheFailed;
            }
        }
        PlanOutcome::Completed
    }

    async fn run_stage(&self, stage: &StageSpec) -> StageOutcome {
        if !self.force.applies_to(&stage.name) {
            if let Some(skipped) = self.executor.skip_if_satisfied(stage).await {
                return skipped;
            }
        }

        if !stage.services.is_empty() {
            if let Some(preflight) = &self.preflight {
                if let Err(message) = preflight.prepare(stage, &stage.services).await {
                    warn!(stage = %stage.name, %message, "required services unavailable");
                    return StageOutcome::Failed(StageFailure::before_start(
                        FailureReason::Preflight { message },
                    ));
                }
            }
        }

        self.executor.run_now(stage).await
    }

    /// Reconciles the cache domains fed by `stage`. Returns false on failure.
    async fn reconcile_after(&self, stage: &StageSpec, recorder: &mut RunRecorder) -> bool {
        let Some(invalidator) = &self.invalidator else {
            return true;
        };
        for domain in self.pipeline.domains_fed_by(stage) {
            let upstream = self.pipeline.upstream_of(domain);
            let action = match invalidator.reconcile(domain, &upstream).await {
                Ok(ReconcileOutcome::Cleared) => {
                    info!(domain = %domain.name, stage = %stage.name, "cache cleared after upstream change");
                    CacheAction::Cleared
                }
                Ok(ReconcileOutcome::Fresh) => CacheAction::Fresh,
                Err(e) => CacheAction::Failed { message: e.to_string() },
            };
            let failed = matches!(action, CacheAction::Failed { .. });
            recorder.record_cache(CacheRecord {
                domain: domain.name.clone(),
                trigger: stage.name.clone(),
                action,
            });
            if failed {
                return false;
            }
        }
        true
    }
}
