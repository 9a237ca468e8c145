//! The validated pipeline DAG and its execution plan.

use super::StageSpec;
use crate::cache::CacheDomain;
use crate::core::{Artifact, ArtifactCatalog};
use crate::errors::{ErrorInfo, PipelineValidationError};
use crate::fetch::SourceSpec;
use crate::gate::ServiceSpec;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

/// A validated pipeline. Built by [`PipelineBuilder`](super::PipelineBuilder).
///
/// Edges are derived from artifacts: stage `B` depends on stage `A` when `B`
/// consumes an artifact `A` produces.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    catalog: Arc<ArtifactCatalog>,
    sources: Vec<SourceSpec>,
    stages: Vec<StageSpec>,
    cache_domains: Vec<CacheDomain>,
    services: Vec<ServiceSpec>,
    /// Stage indices in execution order.
    execution_order: Vec<usize>,
}

impl Pipeline {
    pub(crate) fn new(
        name: String,
        catalog: ArtifactCatalog,
        sources: Vec<SourceSpec>,
        stages: Vec<StageSpec>,
        cache_domains: Vec<CacheDomain>,
        services: Vec<ServiceSpec>,
    ) -> Self {
        let execution_order = topological_sort(&stages);
        Self {
            name,
            catalog: Arc::new(catalog),
            sources,
            stages,
            cache_domains,
            services,
            execution_order,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared artifacts.
    #[must_use]
    pub fn catalog(&self) -> &Arc<ArtifactCatalog> {
        &self.catalog
    }

    /// Remote sources, in declaration order.
    #[must_use]
    pub fn sources(&self) -> &[SourceSpec] {
        &self.sources
    }

    /// Stages, in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Cache domains, in declaration order.
    #[must_use]
    pub fn cache_domains(&self) -> &[CacheDomain] {
        &self.cache_domains
    }

    /// Services, in declaration order.
    #[must_use]
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Looks up a service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Looks up a cache domain.
    #[must_use]
    pub fn cache_domain(&self, name: &str) -> Option<&CacheDomain> {
        self.cache_domains.iter().find(|d| d.name == name)
    }

    /// The stage producing `artifact`, if any.
    #[must_use]
    pub fn producer_of(&self, artifact: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.produces(artifact))
    }

    /// Names of the stages `stage` depends on directly.
    #[must_use]
    pub fn dependencies(&self, stage: &StageSpec) -> Vec<&str> {
        let mut deps: Vec<&str> = stage
            .inputs
            .iter()
            .filter_map(|input| self.producer_of(input))
            .map(|s| s.name.as_str())
            .collect();
        deps.dedup();
        deps
    }

    /// Cache domains derived from any output of `stage`.
    #[must_use]
    pub fn domains_fed_by(&self, stage: &StageSpec) -> Vec<&CacheDomain> {
        self.cache_domains
            .iter()
            .filter(|d| stage.outputs.iter().any(|o| d.depends_on(o)))
            .collect()
    }

    /// Upstream artifacts of a cache domain.
    #[must_use]
    pub fn upstream_of(&self, domain: &CacheDomain) -> Vec<&Artifact> {
        self.catalog.select(&domain.upstream).collect()
    }

    /// Checks that every name refers to a declared stage.
    ///
    /// # Errors
    ///
    /// Returns a `PIPELINE-UNKNOWN-STAGE` error naming the first unknown stage.
    pub fn check_stage_names<S: AsRef<str>>(&self, names: &[S]) -> Result<(), PipelineValidationError> {
        for name in names {
            let name = name.as_ref();
            if self.stage(name).is_none() {
                return Err(PipelineValidationError::new(format!("Unknown stage '{name}'"))
                    .with_subjects(vec![name.to_string()])
                    .with_error_info(
                        ErrorInfo::new("PIPELINE-UNKNOWN-STAGE", format!("Stage '{name}' is not declared"))
                            .with_context_entry("pipeline", &self.name),
                    ));
            }
        }
        Ok(())
    }

    /// Stages in execution order.
    #[must_use]
    pub fn execution_order(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .map(|&i| self.stages[i].name.as_str())
            .collect()
    }

    /// Produces the execution plan.
    #[must_use]
    pub fn plan(&self) -> Plan {
        Plan {
            pipeline: self.name.clone(),
            stages: self
                .execution_order
                .iter()
                .map(|&i| self.stages[i].clone())
                .collect(),
        }
    }
}

/// Stages in the order they will be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pipeline: String,
    stages: Vec<StageSpec>,
}

impl Plan {
    /// Pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Ordered stages.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Ordered stage names.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if there are no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Kahn's algorithm, always picking the ready stage declared first.
///
/// The graph is known to be acyclic; stages left over (which would indicate
/// a cycle) are appended in declaration order.
fn topological_sort(stages: &[StageSpec]) -> Vec<usize> {
    let producer: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .flat_map(|(i, s)| s.outputs.iter().map(move |o| (o.as_str(), i)))
        .collect();

    let mut in_degree = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        let mut deps: Vec<usize> = stage
            .inputs
            .iter()
            .filter_map(|input| producer.get(input.as_str()).copied())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        for dep in deps {
            in_degree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(stages.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &child in &dependents[i] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.push(Reverse(child));
            }
        }
    }

    if order.len() < stages.len() {
        let placed: std::collections::HashSet<usize> = order.iter().copied().collect();
        order.extend((0..stages.len()).filter(|i| !placed.contains(i)));
    }
    order
}

#[cfg(test)]
mod tests {
    use super::super::PipelineBuilder;
    use super::*;
    use pretty_assertions::assert_eq;

    fn stage(name: &str, inputs: &[&str], outputs: &[&str]) -> StageSpec {
        StageSpec::new(name, ["tool"])
            .with_inputs(inputs.iter().copied())
            .with_outputs(outputs.iter().copied())
    }

    fn build(stages: Vec<StageSpec>) -> Pipeline {
        let mut builder = PipelineBuilder::new("test");
        let mut names: Vec<String> = stages
            .iter()
            .flat_map(|s| s.inputs.iter().chain(&s.outputs).cloned())
            .collect();
        names.sort();
        names.dedup();
        for name in names {
            builder = builder.artifact(Artifact::new(&name, format!("/data/{name}")));
        }
        for stage in stages {
            builder = builder.stage(stage);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_dependencies_come_first() {
        let pipeline = build(vec![
            stage("customize", &["part"], &["mld"]),
            stage("extract", &["raw"], &["graph"]),
            stage("partition", &["graph"], &["part"]),
        ]);
        assert_eq!(pipeline.execution_order(), vec!["extract", "partition", "customize"]);
    }

    #[test]
    fn test_ties_broken_by_declaration_order() {
        let pipeline = build(vec![
            stage("import", &["raw"], &["db"]),
            stage("extract", &["raw"], &["graph"]),
            stage("render", &["db"], &["tiles"]),
            stage("partition", &["graph"], &["part"]),
        ]);
        assert_eq!(
            pipeline.execution_order(),
            vec!["import", "extract", "render", "partition"]
        );
        assert_eq!(pipeline.plan().stage_names(), pipeline.execution_order());
    }

    #[test]
    fn test_diamond() {
        let pipeline = build(vec![
            stage("join", &["left", "right"], &["joined"]),
            stage("right", &["src"], &["right"]),
            stage("left", &["src"], &["left"]),
            stage("source", &[], &["src"]),
        ]);
        assert_eq!(pipeline.execution_order(), vec!["source", "right", "left", "join"]);
        let join = pipeline.stage("join").unwrap();
        assert_eq!(pipeline.dependencies(join), vec!["left", "right"]);
    }

    #[test]
    fn test_domains_fed_by() {
        let pipeline = PipelineBuilder::new("p")
            .artifact(Artifact::new("graph", "/data/graph"))
            .artifact(Artifact::new("part", "/data/part"))
            .stage(stage("extract", &[], &["graph"]))
            .stage(stage("partition", &["graph"], &["part"]))
            .cache_domain(CacheDomain::new("tiles", "/data/tiles", ["part"]))
            .build()
            .unwrap();
        let extract = pipeline.stage("extract").unwrap();
        let partition = pipeline.stage("partition").unwrap();
        assert!(pipeline.domains_fed_by(extract).is_empty());
        assert_eq!(pipeline.domains_fed_by(partition).len(), 1);
        assert_eq!(pipeline.upstream_of(&pipeline.cache_domains()[0]).len(), 1);
    }

    #[test]
    fn test_check_stage_names() {
        let pipeline = build(vec![stage("extract", &[], &["graph"])]);
        assert!(pipeline.check_stage_names(&["extract"]).is_ok());
        let err = pipeline.check_stage_names(&["extrct"]).unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-UNKNOWN-STAGE"));
    }
}
