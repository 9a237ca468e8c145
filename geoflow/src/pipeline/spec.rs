//! Stage specifications.

use crate::core::DurationClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A host path exposed to a containerized tool, rendered by `{bindings}` as
/// `-v <host>:<target>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    /// Host path. Relative paths are resolved against the data directory.
    pub host: PathBuf,
    /// Path inside the container.
    pub target: String,
}

impl Binding {
    /// Creates a binding.
    #[must_use]
    pub fn new(host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
        }
    }
}

/// Specification for a single stage in a pipeline.
///
/// A stage consumes `inputs` and produces `outputs` (artifact names) by
/// running `command`, an argv template. Edges between stages are derived
/// from artifacts: a stage depends on whichever stage produces one of its
/// inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// Input artifact names, in order.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output artifact names, in order.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Program and arguments, with `{...}` placeholders.
    pub command: Vec<String>,
    /// Working directory. Relative paths are resolved against the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Host paths rendered by the `{bindings}` placeholder.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    /// Expected runtime, for reporting.
    #[serde(default)]
    pub duration: DurationClass,
    /// Wall-clock timeout; falls back to the pipeline default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Services that must be ready before the command runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    /// The tool writes each output to `<path>.partial`; outputs are renamed
    /// into place once they validate.
    #[serde(default)]
    pub staged: bool,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new<S: Into<String>>(name: impl Into<String>, command: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            command: command.into_iter().map(Into::into).collect(),
            workdir: None,
            env: BTreeMap::new(),
            bindings: Vec::new(),
            duration: DurationClass::default(),
            timeout_secs: None,
            services: Vec::new(),
            staged: false,
        }
    }

    /// Sets the input artifacts.
    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the output artifacts.
    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds a path binding.
    #[must_use]
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Sets the duration class.
    #[must_use]
    pub const fn with_duration(mut self, duration: DurationClass) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the wall-clock timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Sets the services needed before the command runs.
    #[must_use]
    pub fn with_services(mut self, services: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    /// Marks outputs as staged through `.partial` files.
    #[must_use]
    pub const fn staged(mut self) -> Self {
        self.staged = true;
        self
    }

    /// Effective timeout given the pipeline default.
    #[must_use]
    pub fn timeout(&self, default_secs: Option<u64>) -> Option<Duration> {
        self.timeout_secs.or(default_secs).map(Duration::from_secs)
    }

    /// Returns true if the stage consumes `artifact`.
    #[must_use]
    pub fn consumes(&self, artifact: &str) -> bool {
        self.inputs.iter().any(|i| i == artifact)
    }

    /// Returns true if the stage produces `artifact`.
    #[must_use]
    pub fn produces(&self, artifact: &str) -> bool {
        self.outputs.iter().any(|o| o == artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_spec_creation() {
        let spec = StageSpec::new("extract", ["osmium", "extract", "{raw}", "-o", "{graph}"])
            .with_inputs(["raw"])
            .with_outputs(["graph"])
            .with_duration(DurationClass::Long);

        assert_eq!(spec.name, "extract");
        assert!(spec.consumes("raw"));
        assert!(spec.produces("graph"));
        assert!(!spec.produces("raw"));
        assert_eq!(spec.command.len(), 5);
    }

    #[test]
    fn test_timeout_falls_back_to_default() {
        let spec = StageSpec::new("s", ["true"]);
        assert_eq!(spec.timeout(None), None);
        assert_eq!(spec.timeout(Some(60)), Some(Duration::from_secs(60)));
        assert_eq!(spec.with_timeout_secs(5).timeout(Some(60)), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_yaml_defaults() {
        let spec: StageSpec = serde_yaml::from_str(
            "name: partition\ninputs: [graph]\noutputs: [partitions]\ncommand: [osrm-partition, '{graph}']\nduration: very_long\n",
        )
        .unwrap();
        assert_eq!(spec.duration, DurationClass::VeryLong);
        assert!(!spec.staged);
        assert!(spec.services.is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = serde_yaml::from_str::<StageSpec>("name: x\ncommand: [echo]\ndepends_on: [y]\n");
        assert!(result.is_err());
    }
}
