//! Pipeline builder with validation.

use super::{Pipeline, StageSpec};
use crate::cache::CacheDomain;
use crate::core::{Artifact, ArtifactCatalog};
use crate::errors::{CycleDetectedError, ErrorInfo, PipelineValidationError};
use crate::fetch::SourceSpec;
use crate::gate::{ProbeSpec, ServiceSpec};
use crate::stages::{check_template, TemplateError};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").expect("valid name regex"));

/// Builder for creating validated pipelines.
///
/// Everything is checked in [`build`](Self::build), before any command can
/// run.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    name: String,
    artifacts: Vec<Artifact>,
    sources: Vec<SourceSpec>,
    stages: Vec<StageSpec>,
    cache_domains: Vec<CacheDomain>,
    services: Vec<ServiceSpec>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declares an artifact.
    #[must_use]
    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Declares a remote source for an artifact.
    #[must_use]
    pub fn source(mut self, source: SourceSpec) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds a stage. Declaration order breaks ties in the execution order.
    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Declares a cache domain.
    #[must_use]
    pub fn cache_domain(mut self, domain: CacheDomain) -> Self {
        self.cache_domains.push(domain);
        self
    }

    /// Declares a service.
    #[must_use]
    pub fn service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the declarations and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: duplicate or malformed names,
    /// references to undeclared artifacts or services, artifacts with more
    /// than one producer, stages consuming their own outputs, empty commands,
    /// unknown template placeholders, and dependency cycles (with the cycle
    /// path).
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        let catalog = self.validate_artifacts()?;
        let producers = self.validate_stages(&catalog)?;
        self.validate_sources(&catalog, &producers)?;
        self.validate_services(&catalog)?;
        self.validate_cache_domains(&catalog)?;
        detect_cycles(&self.stages, &producers)?;

        Ok(Pipeline::new(
            self.name,
            catalog,
            self.sources,
            self.stages,
            self.cache_domains,
            self.services,
        ))
    }

    fn validate_artifacts(&self) -> Result<ArtifactCatalog, PipelineValidationError> {
        let mut catalog = ArtifactCatalog::new();
        for artifact in &self.artifacts {
            check_name("artifact", &artifact.name)?;
            if !catalog.insert(artifact.clone()) {
                return Err(duplicate("artifact", &artifact.name));
            }
        }
        Ok(catalog)
    }

    /// Returns the producing stage of every produced artifact.
    fn validate_stages(
        &self,
        catalog: &ArtifactCatalog,
    ) -> Result<HashMap<String, String>, PipelineValidationError> {
        let mut names = HashSet::new();
        let mut producers: HashMap<String, String> = HashMap::new();
        let services: HashSet<&str> = self.services.iter().map(|s| s.name.as_str()).collect();

        for stage in &self.stages {
            check_name("stage", &stage.name)?;
            if !names.insert(stage.name.as_str()) {
                return Err(duplicate("stage", &stage.name));
            }
            if stage.command.is_empty() {
                return Err(stage_error(
                    &stage.name,
                    "PIPELINE-EMPTY-COMMAND",
                    format!("Stage '{}' has an empty command", stage.name),
                    "Give the stage a program to run.",
                ));
            }
            if stage.outputs.is_empty() {
                return Err(stage_error(
                    &stage.name,
                    "PIPELINE-NO-OUTPUTS",
                    format!("Stage '{}' declares no outputs", stage.name),
                    "Declare the artifacts the stage produces so reruns can be skipped.",
                ));
            }

            for name in stage.inputs.iter().chain(&stage.outputs) {
                if !catalog.contains(name) {
                    return Err(unknown_artifact(&stage.name, name));
                }
            }

            for output in &stage.outputs {
                if stage.consumes(output) {
                    return Err(stage_error(
                        &stage.name,
                        "PIPELINE-SELF-DEPENDENCY",
                        format!("Stage '{}' consumes its own output '{output}'", stage.name),
                        "Write to a new artifact instead of rewriting an input in place.",
                    )
                    .with_subjects(vec![stage.name.clone(), output.clone()]));
                }
                if let Some(other) = producers.insert(output.clone(), stage.name.clone()) {
                    return Err(multiple_producers(output, &other, &stage.name));
                }
            }

            for service in &stage.services {
                if !services.contains(service.as_str()) {
                    return Err(stage_error(
                        &stage.name,
                        "PIPELINE-UNKNOWN-SERVICE",
                        format!("Stage '{}' needs undeclared service '{service}'", stage.name),
                        "Declare the service under `services`.",
                    )
                    .with_subjects(vec![stage.name.clone(), service.clone()]));
                }
            }

            let mut known: Vec<&str> = stage.inputs.iter().map(String::as_str).collect();
            known.extend(stage.outputs.iter().map(String::as_str));
            if let Err(e) = check_template(&stage.command, &known) {
                let hint = match e {
                    TemplateError::UnknownPlaceholder(_) => {
                        "Placeholders may only name the stage's own inputs and outputs, or {data_dir}."
                    }
                    _ => "Pass {bindings} as a standalone argument.",
                };
                return Err(stage_error(
                    &stage.name,
                    "PIPELINE-TEMPLATE",
                    format!("Stage '{}' has an invalid command template: {e}", stage.name),
                    hint,
                ));
            }
        }
        Ok(producers)
    }

    fn validate_sources(
        &self,
        catalog: &ArtifactCatalog,
        producers: &HashMap<String, String>,
    ) -> Result<(), PipelineValidationError> {
        let mut fetched = HashSet::new();
        for source in &self.sources {
            if !catalog.contains(&source.artifact) {
                return Err(unknown_artifact("sources", &source.artifact));
            }
            if let Some(stage) = producers.get(&source.artifact) {
                return Err(multiple_producers(&source.artifact, "sources", stage));
            }
            if !fetched.insert(source.artifact.as_str()) {
                return Err(multiple_producers(&source.artifact, "sources", "sources"));
            }
        }
        Ok(())
    }

    fn validate_services(&self, catalog: &ArtifactCatalog) -> Result<(), PipelineValidationError> {
        let mut names = HashSet::new();
        for service in &self.services {
            check_name("service", &service.name)?;
            if !names.insert(service.name.as_str()) {
                return Err(duplicate("service", &service.name));
            }
            for name in &service.prerequisites {
                if !catalog.contains(name) {
                    return Err(unknown_artifact(&service.name, name));
                }
            }
            if matches!(&service.start, Some(argv) if argv.is_empty()) {
                return Err(PipelineValidationError::new(format!(
                    "Service '{}' has an empty start command",
                    service.name
                ))
                .with_subjects(vec![service.name.clone()])
                .with_error_info(ErrorInfo::new(
                    "PIPELINE-EMPTY-COMMAND",
                    "Start command is empty",
                )));
            }
            let prerequisites: Vec<&str> = service.prerequisites.iter().map(String::as_str).collect();
            let commands = service.start.iter().chain(match &service.probe {
                ProbeSpec::Command(argv) => Some(argv),
                _ => None,
            });
            for argv in commands {
                if let Err(e) = check_template(argv, &prerequisites) {
                    return Err(PipelineValidationError::new(format!(
                        "Service '{}' has an invalid command template: {e}",
                        service.name
                    ))
                    .with_subjects(vec![service.name.clone()])
                    .with_error_info(
                        ErrorInfo::new("PIPELINE-TEMPLATE", "Invalid service command template")
                            .with_fix_hint("Service commands may only name the service's prerequisites, or {data_dir}."),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_cache_domains(&self, catalog: &ArtifactCatalog) -> Result<(), PipelineValidationError> {
        let mut names = HashSet::new();
        for domain in &self.cache_domains {
            check_name("cache domain", &domain.name)?;
            if !names.insert(domain.name.as_str()) {
                return Err(duplicate("cache domain", &domain.name));
            }
            for name in &domain.upstream {
                if !catalog.contains(name) {
                    return Err(unknown_artifact(&domain.name, name));
                }
            }
        }
        Ok(())
    }
}

/// Detects cycles in the stage graph. Stage `A` depends on stage `B` when `A`
/// consumes an artifact `B` produces.
fn detect_cycles(
    stages: &[StageSpec],
    producers: &HashMap<String, String>,
) -> Result<(), CycleDetectedError> {
    let dependencies: BTreeMap<&str, Vec<&str>> = stages
        .iter()
        .map(|stage| {
            let deps = stage
                .inputs
                .iter()
                .filter_map(|input| producers.get(input).map(String::as_str))
                .collect();
            (stage.name.as_str(), deps)
        })
        .collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for stage in stages {
        if !visited.contains(stage.name.as_str()) {
            if let Some(cycle) = dfs_cycle(&stage.name, &dependencies, &mut visited, &mut rec_stack, &mut path) {
                return Err(CycleDetectedError::new(cycle));
            }
        }
    }
    Ok(())
}

fn dfs_cycle<'a>(
    node: &'a str,
    dependencies: &BTreeMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for &dep in dependencies.get(node).into_iter().flatten() {
        if !visited.contains(dep) {
            if let Some(cycle) = dfs_cycle(dep, dependencies, visited, rec_stack, path) {
                return Some(cycle);
            }
        } else if rec_stack.contains(dep) {
            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
            cycle.push(dep.to_string());
            return Some(cycle);
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

fn check_name(kind: &str, name: &str) -> Result<(), PipelineValidationError> {
    if NAME_RE.is_match(name) {
        return Ok(());
    }
    Err(
        PipelineValidationError::new(format!("Invalid {kind} name '{name}'"))
            .with_subjects(vec![name.to_string()])
            .with_error_info(
                ErrorInfo::new("PIPELINE-INVALID-NAME", format!("'{name}' is not a valid {kind} name"))
                    .with_fix_hint("Names start with a letter or underscore and contain only letters, digits, '_' and '-'."),
            ),
    )
}

fn duplicate(kind: &str, name: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!("Duplicate {kind} name '{name}'"))
        .with_subjects(vec![name.to_string()])
        .with_error_info(
            ErrorInfo::new("PIPELINE-DUPLICATE", format!("{kind} '{name}' is declared twice"))
                .with_context_entry("kind", kind),
        )
}

fn unknown_artifact(owner: &str, artifact: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!("'{owner}' references undeclared artifact '{artifact}'"))
        .with_subjects(vec![owner.to_string(), artifact.to_string()])
        .with_error_info(
            ErrorInfo::new("PIPELINE-UNKNOWN-ARTIFACT", format!("Artifact '{artifact}' not declared"))
                .with_fix_hint("Declare the artifact under `artifacts`."),
        )
}

fn multiple_producers(artifact: &str, first: &str, second: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!(
        "Artifact '{artifact}' is produced by both '{first}' and '{second}'"
    ))
    .with_subjects(vec![artifact.to_string(), first.to_string(), second.to_string()])
    .with_error_info(
        ErrorInfo::new("PIPELINE-MULTIPLE-PRODUCERS", format!("Artifact '{artifact}' has more than one producer"))
            .with_fix_hint("Each artifact is fetched or produced by exactly one step."),
    )
}

fn stage_error(stage: &str, code: &str, message: String, hint: &str) -> PipelineValidationError {
    PipelineValidationError::new(message.clone())
        .with_subjects(vec![stage.to_string()])
        .with_error_info(ErrorInfo::new(code, message).with_fix_hint(hint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ProbeSpec;

    fn artifacts(builder: PipelineBuilder, names: &[&str]) -> PipelineBuilder {
        names.iter().fold(builder, |b, name| {
            b.artifact(Artifact::new(*name, format!("/data/{name}")))
        })
    }

    fn stage(name: &str, inputs: &[&str], outputs: &[&str]) -> StageSpec {
        StageSpec::new(name, ["tool"])
            .with_inputs(inputs.iter().copied())
            .with_outputs(outputs.iter().copied())
    }

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("osrm").stage(stage("extract", &[], &["graph"]));
        assert_eq!(builder.name(), "osrm");
        assert_eq!(builder.stage_count(), 1);
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = artifacts(PipelineBuilder::new("osrm"), &["raw", "graph", "part"])
            .source(SourceSpec::new("raw", "https://example.com/monaco.osm.pbf"))
            .stage(stage("extract", &["raw"], &["graph"]))
            .stage(stage("partition", &["graph"], &["part"]))
            .cache_domain(CacheDomain::new("tiles", "/data/tiles", ["part"]))
            .service(ServiceSpec::new("osrm", ProbeSpec::Tcp("localhost:5000".into())).with_prerequisites(["part"]))
            .build()
            .unwrap();
        assert_eq!(pipeline.stages().len(), 2);
    }

    #[test]
    fn test_duplicate_stage() {
        let err = artifacts(PipelineBuilder::new("p"), &["a", "b"])
            .stage(stage("s", &[], &["a"]))
            .stage(stage("s", &[], &["b"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-DUPLICATE"));
    }

    #[test]
    fn test_duplicate_artifact() {
        let err = artifacts(PipelineBuilder::new("p"), &["a", "a"]).build().unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-DUPLICATE"));
    }

    #[test]
    fn test_unknown_artifact() {
        let err = artifacts(PipelineBuilder::new("p"), &["graph"])
            .stage(stage("extract", &["raw"], &["graph"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-UNKNOWN-ARTIFACT"));
        assert_eq!(err.subjects, vec!["extract".to_string(), "raw".to_string()]);
    }

    #[test]
    fn test_two_producers() {
        let err = artifacts(PipelineBuilder::new("p"), &["graph"])
            .stage(stage("a", &[], &["graph"]))
            .stage(stage("b", &[], &["graph"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-MULTIPLE-PRODUCERS"));
    }

    #[test]
    fn test_fetched_artifact_cannot_be_produced() {
        let err = artifacts(PipelineBuilder::new("p"), &["raw"])
            .source(SourceSpec::new("raw", "https://example.com/raw"))
            .stage(stage("a", &[], &["raw"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-MULTIPLE-PRODUCERS"));
    }

    #[test]
    fn test_self_dependency() {
        let err = artifacts(PipelineBuilder::new("p"), &["graph"])
            .stage(stage("a", &["graph"], &["graph"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-SELF-DEPENDENCY"));
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = artifacts(PipelineBuilder::new("p"), &["x", "y", "z"])
            .stage(stage("a", &["z"], &["x"]))
            .stage(stage("b", &["x"], &["y"]))
            .stage(stage("c", &["y"], &["z"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-CYCLE"));
        assert_eq!(err.subjects.first(), err.subjects.last());
        assert_eq!(err.subjects.len(), 4);
        assert!(err.to_string().contains("->"));
    }

    #[test]
    fn test_empty_command_and_no_outputs() {
        let err = artifacts(PipelineBuilder::new("p"), &["a"])
            .stage(StageSpec::new("s", Vec::<String>::new()).with_outputs(["a"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-EMPTY-COMMAND"));

        let err = PipelineBuilder::new("p")
            .stage(StageSpec::new("s", ["true"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-NO-OUTPUTS"));
    }

    #[test]
    fn test_unknown_service_and_placeholder() {
        let err = artifacts(PipelineBuilder::new("p"), &["a"])
            .stage(stage("s", &[], &["a"]).with_services(["db"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-UNKNOWN-SERVICE"));

        let err = artifacts(PipelineBuilder::new("p"), &["a"])
            .stage(StageSpec::new("s", ["tool", "{b}"]).with_outputs(["a"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-TEMPLATE"));
    }

    #[test]
    fn test_invalid_names() {
        let err = PipelineBuilder::new("p")
            .artifact(Artifact::new("monaco.osm", "/data/monaco.osm"))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-INVALID-NAME"));
    }

    #[test]
    fn test_cache_domain_references() {
        let err = PipelineBuilder::new("p")
            .cache_domain(CacheDomain::new("tiles", "/data/tiles", ["part"]))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-UNKNOWN-ARTIFACT"));
    }
}
