//! Artifact fetcher: resumable, verified downloads of source artifacts.
//!
//! Bytes land in `<path>.part`. A retry (or the next run) resumes from the
//! length of that file with a `Range` request. Only a transfer that passes
//! the size and hash checks is renamed onto the artifact path, so a valid
//! artifact is never replaced by a broken one.

mod fetcher;
mod progress;
mod source;

pub use fetcher::{FetchedArtifact, Fetcher, PART_SUFFIX};
pub use progress::{ProgressReporter, ProgressSnapshot};
pub use source::{parse_content_range, ArtifactSource, ByteStream, HttpSource, SourceResponse};

use crate::config::FetchSettings;
use crate::core::HashAlgorithm;
use crate::errors::ErrorKind;
use crate::pipeline::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

/// Errors raised while fetching an artifact.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network error, timeout or stalled transfer. Retried.
    #[error("transfer from {url} failed: {message}")]
    Transient {
        /// Source URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// The server answered with an error status.
    #[error("{url} returned HTTP {status}")]
    Http {
        /// Source URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The transferred file failed the size or hash check.
    #[error("artifact '{artifact}' failed verification: {detail}")]
    Corrupt {
        /// Artifact name.
        artifact: String,
        /// The failed check.
        detail: String,
    },

    /// The disk filled up while writing.
    #[error("disk full while writing {}", path.display())]
    DiskFull {
        /// File being written.
        path: PathBuf,
    },

    /// A local filesystem error.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The checksum file did not contain a usable digest.
    #[error("invalid checksum file {url}: {message}")]
    Checksum {
        /// Checksum URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// The run was cancelled during the transfer.
    #[error("download cancelled: {0}")]
    Cancelled(String),
}

impl FetchError {
    /// Returns true if the fetcher should retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::TransientIo,
            Self::Http { .. } if self.is_retryable() => ErrorKind::TransientIo,
            Self::Http { .. } | Self::Checksum { .. } => ErrorKind::ConfigurationError,
            Self::Corrupt { .. } => ErrorKind::CorruptArtifact,
            Self::DiskFull { .. } | Self::Io { .. } => ErrorKind::Internal,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.raw_os_error() == Some(ENOSPC) {
            Self::DiskFull { path }
        } else {
            Self::Io { path, source }
        }
    }
}

/// Where a source artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    /// Destination artifact name.
    pub artifact: String,
    /// Download URL.
    pub url: String,
    /// URL of a checksum file whose first token is the hex digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_url: Option<String>,
    /// Algorithm of the checksum file.
    #[serde(default = "default_checksum_algorithm")]
    pub checksum_algorithm: HashAlgorithm,
}

const fn default_checksum_algorithm() -> HashAlgorithm {
    HashAlgorithm::Md5
}

impl SourceSpec {
    /// Creates a source without a checksum file.
    #[must_use]
    pub fn new(artifact: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            url: url.into(),
            checksum_url: None,
            checksum_algorithm: default_checksum_algorithm(),
        }
    }
}

/// Per-download options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Abort an attempt when no bytes arrive for this long.
    pub stall_timeout: Duration,
    /// Minimum time between progress events.
    pub progress_interval: Duration,
    /// Checksum file to verify against when the artifact declares no hash.
    pub checksum_url: Option<String>,
    /// Algorithm of the checksum file.
    pub checksum_algorithm: HashAlgorithm,
}

impl FetchOptions {
    /// Builds options from fetch settings.
    #[must_use]
    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self {
            retry: settings.retry_config(),
            stall_timeout: settings.stall_timeout(),
            progress_interval: settings.progress_interval(),
            checksum_url: None,
            checksum_algorithm: default_checksum_algorithm(),
        }
    }

    /// Adds the checksum file of a source.
    #[must_use]
    pub fn for_source(mut self, source: &SourceSpec) -> Self {
        self.checksum_url.clone_from(&source.checksum_url);
        self.checksum_algorithm = source.checksum_algorithm;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the stall timeout.
    #[must_use]
    pub const fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_settings(&FetchSettings::default())
    }
}
