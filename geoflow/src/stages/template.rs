//! Command template rendering.
//!
//! Placeholders:
//! - `{data_dir}`: the data directory
//! - `{<artifact>}`: absolute path of an input or output artifact
//! - `{<artifact>.file}`: its file name
//! - `{bindings}`: as a whole argument, expands to `-v <host>:<target>` pairs

use crate::pipeline::Binding;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_\-]*(?:\.file)?)\}").expect("valid placeholder regex")
});

const DATA_DIR: &str = "data_dir";
const BINDINGS: &str = "bindings";
const FILE_SUFFIX: &str = ".file";

/// Template rendering errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The template references something the stage does not declare.
    #[error("unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),
    /// `{bindings}` appears inside a larger argument.
    #[error("'{{bindings}}' must be a whole argument, found in '{0}'")]
    EmbeddedBindings(String),
    /// The command is empty.
    #[error("command is empty")]
    EmptyCommand,
}

/// Values available to a stage's command template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    data_dir: PathBuf,
    artifacts: BTreeMap<String, PathBuf>,
    bindings: Vec<(PathBuf, String)>,
}

impl TemplateContext {
    /// Creates a context for `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Makes `{name}` render as `path`.
    #[must_use]
    pub fn with_artifact(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.artifacts.insert(name.into(), path.into());
        self
    }

    /// Adds bindings, resolving relative host paths against the data directory.
    #[must_use]
    pub fn with_bindings(mut self, bindings: &[Binding]) -> Self {
        for binding in bindings {
            let host = if binding.host.is_absolute() {
                binding.host.clone()
            } else {
                self.data_dir.join(&binding.host)
            };
            self.bindings.push((host, binding.target.clone()));
        }
        self
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if key == DATA_DIR {
            return Some(self.data_dir.display().to_string());
        }
        if let Some(name) = key.strip_suffix(FILE_SUFFIX) {
            return self.artifacts.get(name).map(|p| file_name(p));
        }
        self.artifacts.get(key).map(|p| p.display().to_string())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Renders an argv template.
///
/// # Errors
///
/// Returns an error on unknown placeholders, embedded `{bindings}` or an
/// empty command.
pub fn render(command: &[String], ctx: &TemplateContext) -> Result<Vec<String>, TemplateError> {
    if command.is_empty() {
        return Err(TemplateError::EmptyCommand);
    }

    let mut argv = Vec::with_capacity(command.len());
    for arg in command {
        if arg == "{bindings}" {
            for (host, target) in &ctx.bindings {
                argv.push("-v".to_string());
                argv.push(format!("{}:{target}", host.display()));
            }
            continue;
        }

        let mut rendered = String::with_capacity(arg.len());
        let mut last = 0;
        for caps in PLACEHOLDER_RE.captures_iter(arg) {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let key = key.as_str();
            if key == BINDINGS {
                return Err(TemplateError::EmbeddedBindings(arg.clone()));
            }
            let value = ctx
                .lookup(key)
                .ok_or_else(|| TemplateError::UnknownPlaceholder(key.to_string()))?;
            rendered.push_str(&arg[last..whole.start()]);
            rendered.push_str(&value);
            last = whole.end();
        }
        rendered.push_str(&arg[last..]);
        argv.push(rendered);
    }
    Ok(argv)
}

/// Checks a template against the artifact names a stage may reference,
/// without rendering it.
///
/// # Errors
///
/// Returns the first problem found.
pub fn check(command: &[String], artifacts: &[&str]) -> Result<(), TemplateError> {
    if command.first().map_or(true, |program| program.trim().is_empty()) {
        return Err(TemplateError::EmptyCommand);
    }
    for arg in command {
        if arg == "{bindings}" {
            continue;
        }
        for caps in PLACEHOLDER_RE.captures_iter(arg) {
            let Some(key) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            if key == BINDINGS {
                return Err(TemplateError::EmbeddedBindings(arg.clone()));
            }
            let name = key.strip_suffix(FILE_SUFFIX).unwrap_or(key);
            if key != DATA_DIR && !artifacts.contains(&name) {
                return Err(TemplateError::UnknownPlaceholder(key.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn ctx() -> TemplateContext {
        TemplateContext::new("/srv/geo")
            .with_artifact("raw", "/srv/geo/monaco.osm.pbf")
            .with_artifact("graph", "/srv/geo/monaco.osrm")
    }

    #[test]
    fn test_render_paths_and_file_names() {
        let rendered = render(
            &argv(&["osrm-extract", "-p", "{data_dir}/car.lua", "/data/{raw.file}", "--out={graph}"]),
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            argv(&[
                "osrm-extract",
                "-p",
                "/srv/geo/car.lua",
                "/data/monaco.osm.pbf",
                "--out=/srv/geo/monaco.osrm",
            ])
        );
    }

    #[test]
    fn test_render_bindings() {
        let ctx = ctx().with_bindings(&[
            Binding::new("", "/data"),
            Binding::new("/etc/osrm", "/profiles"),
        ]);
        let rendered = render(&argv(&["docker", "run", "{bindings}", "osrm/osrm-backend"]), &ctx).unwrap();
        assert_eq!(
            rendered,
            argv(&[
                "docker",
                "run",
                "-v",
                "/srv/geo/:/data",
                "-v",
                "/etc/osrm:/profiles",
                "osrm/osrm-backend",
            ])
        );
    }

    #[test]
    fn test_render_errors() {
        assert_eq!(
            render(&argv(&["tool", "{nope}"]), &ctx()),
            Err(TemplateError::UnknownPlaceholder("nope".into()))
        );
        assert!(matches!(
            render(&argv(&["tool", "x{bindings}"]), &ctx()),
            Err(TemplateError::EmbeddedBindings(_))
        ));
        assert_eq!(render(&[], &ctx()), Err(TemplateError::EmptyCommand));
    }

    #[test]
    fn test_literal_braces_without_identifier_are_kept() {
        let rendered = render(&argv(&["sh", "-c", "echo {} {1}"]), &ctx()).unwrap();
        assert_eq!(rendered[2], "echo {} {1}");
    }

    #[test]
    fn test_check_against_declared_artifacts() {
        let command = argv(&["tool", "{raw}", "{graph.file}", "{data_dir}", "{bindings}"]);
        assert!(check(&command, &["raw", "graph"]).is_ok());
        assert_eq!(
            check(&command, &["raw"]),
            Err(TemplateError::UnknownPlaceholder("graph.file".into()))
        );
        assert_eq!(check(&argv(&["  "]), &[]), Err(TemplateError::EmptyCommand));
    }
}
