//! Readiness gate for long-running services.
//!
//! A service is only started once its prerequisite artifacts validate. The
//! gate then polls an HTTP, TCP or command [`Probe`] until it passes or the
//! readiness timeout elapses.

mod outcome;
mod probe;
mod readiness;
mod spec;

pub use outcome::GateOutcome;
#[cfg(test)]
pub use probe::MockProbe;
pub use probe::{build_probe, CommandProbe, HttpProbe, Probe, ProbeConfigError, TcpProbe};
pub use readiness::ReadinessGate;
pub use spec::{ProbeSpec, ServiceSpec};
