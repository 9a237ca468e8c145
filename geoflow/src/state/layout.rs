//! Deterministic file layout of a data directory.

use std::path::{Path, PathBuf};

const META_DIR: &str = ".geoflow";

/// A data directory holding artifacts plus the `.geoflow` metadata folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Wraps a data directory path.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a path declared relative to the data directory.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// The metadata folder.
    #[must_use]
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    /// The advisory lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.meta_dir().join("lock")
    }

    /// The persisted run state.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.meta_dir().join("state.json")
    }

    /// Per-stage tool output logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.meta_dir().join("logs")
    }

    /// Log file for one stage.
    #[must_use]
    pub fn stage_log_path(&self, stage: &str) -> PathBuf {
        self.logs_dir().join(format!("{stage}.log"))
    }

    /// Machine-readable report of the most recent run.
    #[must_use]
    pub fn last_run_path(&self) -> PathBuf {
        self.meta_dir().join("last-run.json")
    }

    /// Creates the data directory and its metadata folders.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.logs_dir())
    }
}
