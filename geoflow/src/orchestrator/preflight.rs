//! Brings services up on behalf of stages that need them.

use crate::core::ServiceRecord;
use crate::gate::{ReadinessGate, ServiceSpec};
use crate::pipeline::{Pipeline, StagePreflight, StageSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A [`StagePreflight`] backed by the readiness gate.
///
/// Each service is gated at most once per run. Every gate outcome is kept
/// for the run report.
pub(crate) struct GatePreflight {
    pipeline: Arc<Pipeline>,
    gate: Arc<ReadinessGate>,
    default_timeout: Duration,
    timeout_override: Option<Duration>,
    records: Mutex<Vec<ServiceRecord>>,
    ready: Mutex<BTreeSet<String>>,
}

impl GatePreflight {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        gate: Arc<ReadinessGate>,
        default_timeout: Duration,
        timeout_override: Option<Duration>,
    ) -> Self {
        Self {
            pipeline,
            gate,
            default_timeout,
            timeout_override,
            records: Mutex::new(Vec::new()),
            ready: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn timeout_for(&self, service: &ServiceSpec) -> Duration {
        self.timeout_override
            .unwrap_or_else(|| service.timeout(self.default_timeout))
    }

    /// Gates `service` unless it is already up. Returns true if ready.
    pub(crate) async fn ensure(&self, service: &ServiceSpec) -> bool {
        if self.ready.lock().contains(&service.name) {
            return true;
        }
        let outcome = self.gate.await_ready(service, self.timeout_for(service)).await;
        let ready = outcome.is_ready();
        self.records.lock().push(ServiceRecord {
            service: service.name.clone(),
            outcome,
        });
        if ready {
            self.ready.lock().insert(service.name.clone());
        }
        ready
    }

    pub(crate) fn is_ready(&self, service: &str) -> bool {
        self.ready.lock().contains(service)
    }

    /// Takes the gate outcomes recorded so far.
    pub(crate) fn take_records(&self) -> Vec<ServiceRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

#[async_trait]
impl StagePreflight for GatePreflight {
    async fn prepare(&self, stage: &StageSpec, services: &[String]) -> Result<(), String> {
        for name in services {
            let Some(service) = self.pipeline.service(name) else {
                return Err(format!("service '{name}' is not declared"));
            };
            info!(stage = %stage.name, service = %name, "bringing up service for stage");
            if !self.ensure(service).await {
                let outcome = self
                    .records
                    .lock()
                    .iter()
                    .rev()
                    .find(|r| &r.service == name)
                    .map(|r| r.outcome.to_string())
                    .unwrap_or_default();
                return Err(format!("{name}: {outcome}"));
            }
        }
        Ok(())
    }
}
