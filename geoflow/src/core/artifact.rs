//! Artifacts: named, validity-checked files produced by the pipeline.

use super::digest::{hash_file, ContentHash};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A named file consumed or produced by the pipeline.
///
/// An artifact is valid iff it exists, its size is at least `min_size`, and
/// (when `hash` is set) its content matches the hash. The production
/// timestamp is the file's modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique artifact name, used in templates and reports.
    pub name: String,
    /// Location on disk. Relative paths are resolved against the data directory.
    pub path: PathBuf,
    /// Minimum size in bytes for the artifact to count as valid.
    #[serde(default = "default_min_size")]
    pub min_size: u64,
    /// Expected content hash, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
}

const fn default_min_size() -> u64 {
    1
}

/// Size and timestamp of an artifact that exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactMeta {
    /// Size in bytes.
    pub size: u64,
    /// Modification time.
    pub modified: SystemTime,
}

/// Result of validating an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// The artifact is valid.
    Valid(ArtifactMeta),
    /// No file at the artifact path.
    Missing,
    /// The file is smaller than the declared minimum.
    TooSmall {
        /// Actual size.
        size: u64,
        /// Declared minimum.
        min_size: u64,
    },
    /// The content does not match the declared hash.
    HashMismatch {
        /// Declared hash.
        expected: String,
        /// Computed digest.
        actual: String,
    },
    /// The file exists but could not be inspected.
    Unreadable(String),
}

impl Validity {
    /// Returns true if the artifact is valid.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Returns the metadata of a valid artifact.
    #[must_use]
    pub const fn meta(&self) -> Option<&ArtifactMeta> {
        match self {
            Self::Valid(meta) => Some(meta),
            _ => None,
        }
    }

    /// Human-readable description, used in failure reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Valid(meta) => format!("valid ({} bytes)", meta.size),
            Self::Missing => "missing".to_string(),
            Self::TooSmall { size, min_size } => {
                format!("too small ({size} bytes, minimum {min_size})")
            }
            Self::HashMismatch { expected, actual } => {
                format!("hash mismatch (expected {expected}, got {actual})")
            }
            Self::Unreadable(reason) => format!("unreadable ({reason})"),
        }
    }
}

impl Artifact {
    /// Creates an artifact with the default minimum size of one byte.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            min_size: default_min_size(),
            hash: None,
        }
    }

    /// Sets the minimum size.
    #[must_use]
    pub const fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    /// Sets the expected content hash.
    #[must_use]
    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Returns the file name component of the path.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Returns a sibling path with `suffix` appended to the file name.
    #[must_use]
    pub fn sibling(&self, suffix: &str) -> PathBuf {
        sibling_path(&self.path, suffix)
    }

    /// Reads size and mtime without validating.
    pub async fn stat(&self) -> std::io::Result<Option<ArtifactMeta>> {
        stat_path(&self.path).await
    }

    /// Validates the artifact at its own path.
    pub async fn validate(&self) -> Validity {
        self.validate_at(&self.path).await
    }

    /// Validates a candidate file (e.g. a download in progress) against this
    /// artifact's size and hash requirements.
    pub async fn validate_at(&self, path: &Path) -> Validity {
        let meta = match stat_path(path).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Validity::Missing,
            Err(err) => return Validity::Unreadable(err.to_string()),
        };

        if meta.size < self.min_size {
            return Validity::TooSmall {
                size: meta.size,
                min_size: self.min_size,
            };
        }

        if let Some(expected) = &self.hash {
            let algorithm = expected.algorithm;
            let owned = path.to_path_buf();
            let digest = tokio::task::spawn_blocking(move || hash_file(&owned, algorithm)).await;
            match digest {
                Ok(Ok(actual)) if expected.matches(&actual) => {}
                Ok(Ok(actual)) => {
                    return Validity::HashMismatch {
                        expected: expected.to_string(),
                        actual: format!("{algorithm}:{actual}"),
                    }
                }
                Ok(Err(err)) => return Validity::Unreadable(err.to_string()),
                Err(err) => return Validity::Unreadable(err.to_string()),
            }
        }

        Validity::Valid(meta)
    }
}

/// Appends `suffix` to the final path component.
#[must_use]
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

async fn stat_path(path: &Path) -> std::io::Result<Option<ArtifactMeta>> {
    match tokio::fs::metadata(path).await {
        Ok(md) if md.is_file() => Ok(Some(ArtifactMeta {
            size: md.len(),
            modified: md.modified()?,
        })),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HashAlgorithm;

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact::new("graph", dir.path().join("graph.bin"));
        assert_eq!(artifact.validate().await, Validity::Missing);
    }

    #[tokio::test]
    async fn test_empty_file_is_invalid_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.bin");
        std::fs::write(&path, b"").unwrap();

        let validity = Artifact::new("graph", &path).validate().await;
        assert_eq!(validity, Validity::TooSmall { size: 0, min_size: 1 });
    }

    #[tokio::test]
    async fn test_min_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.bin");
        std::fs::write(&path, vec![0u8; 50]).unwrap();

        let small = Artifact::new("graph", &path).with_min_size(1000);
        assert!(!small.validate().await.is_valid());

        let ok = Artifact::new("graph", &path).with_min_size(50);
        let validity = ok.validate().await;
        assert!(validity.is_valid());
        assert_eq!(validity.meta().unwrap().size, 50);
    }

    #[tokio::test]
    async fn test_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.pbf");
        std::fs::write(&path, b"abc").unwrap();

        let good = ContentHash::new(HashAlgorithm::Md5, "900150983cd24fb0d6963f7d28e17f72").unwrap();
        assert!(Artifact::new("raw", &path).with_hash(good).validate().await.is_valid());

        let bad = ContentHash::new(HashAlgorithm::Md5, "00000000000000000000000000000000").unwrap();
        let validity = Artifact::new("raw", &path).with_hash(bad).validate().await;
        assert!(matches!(validity, Validity::HashMismatch { .. }));
        assert!(validity.describe().contains("hash mismatch"));
    }

    #[test]
    fn test_sibling_path() {
        let artifact = Artifact::new("raw", "/data/germany.osm.pbf");
        assert_eq!(artifact.sibling(".part"), PathBuf::from("/data/germany.osm.pbf.part"));
        assert_eq!(artifact.file_name(), "germany.osm.pbf");
    }
}
