//! Pipeline definition files: YAML with `${VAR}` environment substitution.
//!
//! Relative artifact, cache and workdir paths are resolved against the data
//! directory. A relative `data_dir` is resolved against the directory of the
//! definition file.

use super::{Pipeline, PipelineBuilder, StageSpec};
use crate::cache::CacheDomain;
use crate::config::Settings;
use crate::core::Artifact;
use crate::errors::GeoflowError;
use crate::fetch::SourceSpec;
use crate::gate::ServiceSpec;
use crate::state::DataDir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitutes `${VAR}` patterns with environment variable values.
///
/// # Errors
///
/// Returns the names of every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == &cap[1]) {
                missing.push(cap[1].to_string());
            }
            String::new()
        })
    });
    if missing.is_empty() {
        Ok(result.into_owned())
    } else {
        Err(missing)
    }
}

/// A pipeline as written in a definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub pipeline: String,
    /// Data directory; defaults to the definition's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Run-wide settings.
    #[serde(default)]
    pub settings: Settings,
    /// Every file the pipeline knows about.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Downloadable artifacts.
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    /// Build stages.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    /// Derived caches.
    #[serde(default)]
    pub cache_domains: Vec<CacheDomain>,
    /// Runtime services.
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(skip)]
    base_dir: PathBuf,
}

/// A validated pipeline plus where and how to run it.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    /// The validated pipeline.
    pub pipeline: Pipeline,
    /// The data directory.
    pub data_dir: DataDir,
    /// Run-wide settings.
    pub settings: Settings,
}

impl PipelineDefinition {
    /// Parses a definition from YAML text after environment substitution.
    ///
    /// # Errors
    ///
    /// Returns [`GeoflowError::Definition`] for missing variables or invalid
    /// YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, GeoflowError> {
        Self::parse(yaml, Path::new("<inline>"))
    }

    /// Reads and parses a definition file.
    ///
    /// # Errors
    ///
    /// Returns [`GeoflowError::Definition`] if the file cannot be read or
    /// parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeoflowError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| GeoflowError::Definition {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut definition = Self::parse(&text, path)?;
        definition.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(definition)
    }

    fn parse(yaml: &str, path: &Path) -> Result<Self, GeoflowError> {
        let substituted = substitute_env_vars(yaml).map_err(|missing| GeoflowError::Definition {
            path: path.to_path_buf(),
            reason: format!("missing environment variable(s): {}", missing.join(", ")),
        })?;
        serde_yaml::from_str(&substituted).map_err(|e| GeoflowError::Definition {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Resolves the data directory, preferring `override_dir`.
    #[must_use]
    pub fn data_dir(&self, override_dir: Option<&Path>) -> DataDir {
        let root = override_dir
            .map(Path::to_path_buf)
            .or_else(|| self.data_dir.clone())
            .unwrap_or_default();
        if root.is_absolute() {
            DataDir::new(root)
        } else {
            DataDir::new(self.base_dir.join(root))
        }
    }

    /// Resolves paths and validates the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`GeoflowError::Validation`] if the pipeline is invalid.
    pub fn into_pipeline(self, override_dir: Option<&Path>) -> Result<LoadedPipeline, GeoflowError> {
        let data_dir = self.data_dir(override_dir);
        let mut builder = PipelineBuilder::new(self.pipeline);
        for mut artifact in self.artifacts {
            artifact.path = data_dir.resolve(&artifact.path);
            builder = builder.artifact(artifact);
        }
        for source in self.sources {
            builder = builder.source(source);
        }
        for mut stage in self.stages {
            stage.workdir = stage.workdir.map(|w| data_dir.resolve(&w));
            builder = builder.stage(stage);
        }
        for mut domain in self.cache_domains {
            domain.path = data_dir.resolve(&domain.path);
            builder = builder.cache_domain(domain);
        }
        for service in self.services {
            builder = builder.service(service);
        }
        Ok(LoadedPipeline {
            pipeline: builder.build()?,
            data_dir,
            settings: self.settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ProbeSpec;
    use crate::pipeline::{BackoffStrategy, JitterStrategy};
    use pretty_assertions::assert_eq;

    const OSRM: &str = r#"
pipeline: osrm-monaco
data_dir: /srv/geodata
settings:
  readiness_timeout_secs: 120
  fetch:
    max_attempts: 3
    backoff: linear
    jitter: none
artifacts:
  - name: raw
    path: monaco-latest.osm.pbf
    min_size: 1000
  - name: graph
    path: monaco-latest.osrm
  - name: part
    path: monaco-latest.osrm.partition
sources:
  - artifact: raw
    url: https://download.example.org/europe/monaco-latest.osm.pbf
    checksum_url: https://download.example.org/europe/monaco-latest.osm.pbf.md5
stages:
  - name: extract
    command: [osrm-extract, -p, /opt/car.lua, "{raw}"]
    inputs: [raw]
    outputs: [graph]
    duration: long
  - name: partition
    command: [osrm-partition, "{graph}"]
    inputs: [graph]
    outputs: [part]
cache_domains:
  - name: tiles
    path: cache/tiles
    upstream: [part]
services:
  - name: routing
    prerequisites: [part]
    start: [osrm-routed, "{part}"]
    probe:
      http: http://localhost:5000/health
    timeout_secs: 60
"#;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("GEOFLOW_TEST_REGION", "monaco");
        let result = substitute_env_vars("region: ${GEOFLOW_TEST_REGION}").unwrap();
        assert_eq!(result, "region: monaco");
        std::env::remove_var("GEOFLOW_TEST_REGION");
    }

    #[test]
    fn test_missing_env_vars_all_reported() {
        let missing =
            substitute_env_vars("${GEOFLOW_MISSING_A} ${GEOFLOW_MISSING_B} ${GEOFLOW_MISSING_A}")
                .unwrap_err();
        assert_eq!(missing, vec!["GEOFLOW_MISSING_A", "GEOFLOW_MISSING_B"]);
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "pipeline: plain\n";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_parse_full_definition() {
        let definition = PipelineDefinition::from_yaml_str(OSRM).unwrap();
        assert_eq!(definition.pipeline, "osrm-monaco");
        assert_eq!(definition.settings.readiness_timeout_secs, 120);
        assert_eq!(definition.settings.probe_interval_ms, 3_000);
        let retry = definition.settings.fetch.retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(retry.jitter_strategy, JitterStrategy::None);
        assert_eq!(definition.stages.len(), 2);
        assert_eq!(
            definition.services[0].probe,
            ProbeSpec::Http("http://localhost:5000/health".into())
        );
    }

    #[test]
    fn test_into_pipeline_resolves_paths() {
        let loaded = PipelineDefinition::from_yaml_str(OSRM)
            .unwrap()
            .into_pipeline(None)
            .unwrap();
        assert_eq!(loaded.data_dir.root(), Path::new("/srv/geodata"));
        let raw = loaded.pipeline.catalog().get("raw").unwrap();
        assert_eq!(raw.path, PathBuf::from("/srv/geodata/monaco-latest.osm.pbf"));
        assert_eq!(raw.min_size, 1000);
        let tiles = loaded.pipeline.cache_domain("tiles").unwrap();
        assert_eq!(tiles.path, PathBuf::from("/srv/geodata/cache/tiles"));
        assert_eq!(loaded.pipeline.execution_order(), vec!["extract", "partition"]);
    }

    #[test]
    fn test_data_dir_override() {
        let loaded = PipelineDefinition::from_yaml_str(OSRM)
            .unwrap()
            .into_pipeline(Some(Path::new("/tmp/other")))
            .unwrap();
        assert_eq!(loaded.data_dir.root(), Path::new("/tmp/other"));
    }

    #[test]
    fn test_load_resolves_relative_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, OSRM.replace("/srv/geodata", "data")).unwrap();
        let definition = PipelineDefinition::load(&path).unwrap();
        assert_eq!(definition.data_dir(None).root(), dir.path().join("data"));
    }

    #[test]
    fn test_unknown_field_is_definition_error() {
        let err = PipelineDefinition::from_yaml_str("pipeline: x\nstagez: []\n").unwrap_err();
        assert!(matches!(err, GeoflowError::Definition { .. }));
    }

    #[test]
    fn test_invalid_pipeline_is_validation_error() {
        let yaml = "pipeline: x\nstages:\n  - name: a\n    command: [run]\n    outputs: [nope]\n";
        let err = PipelineDefinition::from_yaml_str(yaml)
            .unwrap()
            .into_pipeline(Some(Path::new("/tmp")))
            .unwrap_err();
        assert!(matches!(err, GeoflowError::Validation(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineDefinition::load("/nonexistent/pipeline.yaml").unwrap_err();
        assert!(matches!(err, GeoflowError::Definition { .. }));
    }
}
