//! Named set of declared artifacts.

use super::Artifact;
use std::collections::BTreeMap;

/// All artifacts a pipeline declares, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactCatalog {
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artifact. Returns false if the name was already taken, in
    /// which case the catalog is unchanged.
    pub fn insert(&mut self, artifact: Artifact) -> bool {
        if self.artifacts.contains_key(&artifact.name) {
            return false;
        }
        self.artifacts.insert(artifact.name.clone(), artifact);
        true
    }

    /// Looks up an artifact by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    /// Returns true if `name` is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    /// Looks up several artifacts, skipping unknown names.
    pub fn select<'a, 'n, S: AsRef<str>>(
        &'a self,
        names: &'n [S],
    ) -> impl Iterator<Item = &'a Artifact> + 'n
    where
        'a: 'n,
    {
        names
            .iter()
            .filter_map(move |name| self.artifacts.get(name.as_ref()))
    }

    /// Iterates over all artifacts in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    /// Number of artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if no artifacts are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl FromIterator<Artifact> for ArtifactCatalog {
    fn from_iter<T: IntoIterator<Item = Artifact>>(iter: T) -> Self {
        let mut catalog = Self::new();
        for artifact in iter {
            catalog.insert(artifact);
        }
        catalog
    }
}
