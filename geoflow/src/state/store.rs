//! JSON-backed run state shared between runs.

use crate::errors::GeoflowError;
use crate::utils::iso_timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Watermark recorded when a cache domain was last cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheWatermark {
    /// Newest upstream mtime (nanoseconds since the epoch) at clear time.
    pub upstream_mtime_ns: u64,
    /// When the clear happened.
    pub cleared_at: String,
}

/// Everything persisted in `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Artifact paths left behind by a failed stage.
    #[serde(default)]
    pub unknown_validity: BTreeSet<PathBuf>,
    /// Cache watermarks by domain name.
    #[serde(default)]
    pub caches: BTreeMap<String, CacheWatermark>,
}

/// Thread-safe handle to the persisted run state.
///
/// Every mutation is written back immediately, through a temporary file and
/// a rename, so a crash never leaves a half-written `state.json`.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<RunState>,
}

impl StateStore {
    /// Loads the state file, or starts empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`GeoflowError::State`] if the file exists but cannot be read
    /// or parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, GeoflowError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| GeoflowError::State {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RunState::default(),
            Err(err) => {
                return Err(GeoflowError::State {
                    path,
                    reason: err.to_string(),
                })
            }
        };
        debug!(path = %path.display(), "loaded run state");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// An in-memory store that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Mutex::new(RunState::default()),
        }
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> RunState {
        self.state.lock().clone()
    }

    /// Marks an artifact path as having unknown validity.
    pub fn mark_unknown(&self, path: &Path) -> Result<(), GeoflowError> {
        self.update(|state| state.unknown_validity.insert(path.to_path_buf()))
    }

    /// Clears the unknown-validity mark of an artifact path.
    pub fn clear_unknown(&self, path: &Path) -> Result<(), GeoflowError> {
        self.update(|state| state.unknown_validity.remove(path))
    }

    /// Returns true if the artifact path is marked unknown.
    #[must_use]
    pub fn is_unknown(&self, path: &Path) -> bool {
        self.state.lock().unknown_validity.contains(path)
    }

    /// Returns the watermark of a cache domain.
    #[must_use]
    pub fn watermark(&self, domain: &str) -> Option<CacheWatermark> {
        self.state.lock().caches.get(domain).cloned()
    }

    /// Records a new watermark for a cache domain.
    pub fn set_watermark(&self, domain: &str, upstream_mtime_ns: u64) -> Result<(), GeoflowError> {
        self.update(|state| {
            let watermark = CacheWatermark {
                upstream_mtime_ns,
                cleared_at: iso_timestamp(),
            };
            state.caches.insert(domain.to_string(), watermark);
            true
        })
    }

    /// Applies `apply` to a copy, persists it, then makes it current. A
    /// failed write leaves memory matching what is on disk.
    fn update(&self, apply: impl FnOnce(&mut RunState) -> bool) -> Result<(), GeoflowError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        if !apply(&mut next) {
            return Ok(());
        }
        if !self.path.as_os_str().is_empty() {
            self.persist(&next)?;
        }
        *state = next;
        Ok(())
    }

    fn persist(&self, state: &RunState) -> Result<(), GeoflowError> {
        let to_state_error = |reason: String| GeoflowError::State {
            path: self.path.clone(),
            reason,
        };
        let json = serde_json::to_vec_pretty(state).map_err(|e| to_state_error(e.to_string()))?;
        let tmp = crate::core::sibling_path(&self.path, ".tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| to_state_error(e.to_string()))?;
        }
        std::fs::write(&tmp, json).map_err(|e| to_state_error(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "failed to persist run state");
            to_state_error(e.to_string())
        })
    }
}
