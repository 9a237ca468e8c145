use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A derived-cache directory tied to upstream artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheDomain {
    /// Unique domain name.
    pub name: String,
    /// Cache directory. Relative paths are resolved against the data directory.
    pub path: PathBuf,
    /// Artifacts the cache is derived from.
    pub upstream: Vec<String>,
}

impl CacheDomain {
    /// Creates a cache domain.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        upstream: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            upstream: upstream.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the domain derives from `artifact`.
    #[must_use]
    pub fn depends_on(&self, artifact: &str) -> bool {
        self.upstream.iter().any(|u| u == artifact)
    }
}
