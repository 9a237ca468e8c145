//! Core domain model types for geoflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Artifacts, their validity and content hashes, and the artifact catalog
//! - Stage status, duration class and outcomes
//! - The run report

mod artifact;
mod catalog;
mod digest;
mod outcome;
mod report;
mod status;

pub use artifact::{sibling_path, Artifact, ArtifactMeta, Validity};
pub use catalog::ArtifactCatalog;
pub use digest::{hash_file, parse_checksum_body, ContentHash, ContentHasher, HashAlgorithm};
pub use outcome::{FailureReason, StageFailure, StageOutcome};
pub use report::{
    CacheAction, CacheRecord, FailureKind, FetchRecord, FetchStatus, RunRecorder, RunReport,
    RunStatus, ServiceRecord, StageRecord,
};
pub use status::{DurationClass, StageStatus};
