//! Persisted orchestrator state under `<data_dir>/.geoflow/`.
//!
//! The data directory is the only state shared between runs. This module
//! owns its metadata layout, the advisory lock that rejects concurrent runs,
//! and the small JSON store recording unknown-validity marks and cache
//! watermarks.

mod layout;
mod lock;
mod store;

pub use layout::DataDir;
pub use lock::DataDirLock;
pub use store::{CacheWatermark, RunState, StateStore};
