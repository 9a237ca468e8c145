//! The fetch loop: resume, retry, verify, rename.

use super::{ArtifactSource, FetchError, FetchOptions, ProgressReporter};
use crate::cancellation::CancellationToken;
use crate::core::{parse_checksum_body, Artifact, ContentHash, Validity};
use crate::events::{names, EventSink};
use crate::observability::SpanTimer;
use crate::pipeline::with_retry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Suffix of in-progress downloads.
pub const PART_SUFFIX: &str = ".part";

/// A successfully fetched and verified artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedArtifact {
    /// Artifact name.
    pub name: String,
    /// Final path.
    pub path: PathBuf,
    /// Final size in bytes.
    pub bytes: u64,
    /// Offset the transfer resumed from (0 for a fresh download).
    pub resumed_from: u64,
    /// Time spent in milliseconds.
    pub duration_ms: f64,
}

#[derive(Debug)]
struct Transfer {
    len: u64,
    total_len: Option<u64>,
}

/// Downloads source artifacts.
pub struct Fetcher {
    source: Arc<dyn ArtifactSource>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl Fetcher {
    /// Creates a fetcher over `source`.
    #[must_use]
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        events: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            source,
            events,
            cancel,
        }
    }

    /// Fetches `url` into `artifact`.
    ///
    /// On any returned error the `.part` file is removed and the existing
    /// artifact (if any) is untouched. On cancellation the `.part` file is
    /// kept so the next run resumes from it.
    pub async fn fetch(
        &self,
        url: &str,
        artifact: &Artifact,
        options: &FetchOptions,
    ) -> Result<FetchedArtifact, FetchError> {
        let timer = SpanTimer::start(format!("fetch:{}", artifact.name));
        let part = artifact.sibling(PART_SUFFIX);
        if let Some(parent) = artifact.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(FetchError::Cancelled(self.cancel.reason_or_default())),
            result = self.fetch_into(url, artifact, options, &part) => result,
        };

        match result {
            Ok(mut fetched) => {
                fetched.duration_ms = timer.finish();
                info!(
                    artifact = %artifact.name,
                    bytes = fetched.bytes,
                    resumed_from = fetched.resumed_from,
                    duration_ms = fetched.duration_ms,
                    "artifact fetched"
                );
                self.events.try_emit(
                    names::FETCH_COMPLETED,
                    Some(serde_json::json!({
                        "artifact": artifact.name,
                        "bytes": fetched.bytes,
                        "resumed_from": fetched.resumed_from,
                    })),
                );
                Ok(fetched)
            }
            Err(err @ FetchError::Cancelled(_)) => {
                info!(artifact = %artifact.name, part = %part.display(), "fetch cancelled; partial file kept");
                Err(err)
            }
            Err(err) => {
                remove_part(&part).await;
                warn!(artifact = %artifact.name, error = %err, "fetch failed; partial file removed");
                self.events.try_emit(
                    names::FETCH_FAILED,
                    Some(serde_json::json!({
                        "artifact": artifact.name,
                        "kind": err.kind(),
                        "error": err.to_string(),
                    })),
                );
                Err(err)
            }
        }
    }

    async fn fetch_into(
        &self,
        url: &str,
        artifact: &Artifact,
        options: &FetchOptions,
        part: &Path,
    ) -> Result<FetchedArtifact, FetchError> {
        let expected = self.expected_hash(artifact, options).await?;

        self.events.try_emit(
            names::FETCH_STARTED,
            Some(serde_json::json!({
                "artifact": artifact.name,
                "url": url,
                "partial_bytes": file_len(part).await?,
            })),
        );

        let progress = ProgressReporter::new(
            artifact.name.clone(),
            options.progress_interval,
            Arc::clone(&self.events),
        );
        let stall_timeout = options.stall_timeout;
        let transfer = with_retry(
            &options.retry,
            url,
            || self.transfer_once(url, part, stall_timeout, &progress),
            FetchError::is_retryable,
            |attempt, delay, err| {
                warn!(
                    artifact = %artifact.name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient fetch failure; retrying"
                );
                self.events.try_emit(
                    names::FETCH_RETRY,
                    Some(serde_json::json!({
                        "artifact": artifact.name,
                        "attempt": attempt,
                        "error": err.to_string(),
                    })),
                );
            },
        )
        .await?;
        progress.finish();

        if let Some(total) = transfer.total_len {
            if transfer.len != total {
                return Err(FetchError::Corrupt {
                    artifact: artifact.name.clone(),
                    detail: format!("received {} bytes, source advertised {total}", transfer.len),
                });
            }
        }

        let mut candidate = artifact.clone();
        if expected.is_some() {
            candidate.hash = expected;
        }
        let meta = match candidate.validate_at(part).await {
            Validity::Valid(meta) => meta,
            Validity::Unreadable(reason) => {
                return Err(FetchError::io(part, std::io::Error::other(reason)));
            }
            invalid => {
                return Err(FetchError::Corrupt {
                    artifact: artifact.name.clone(),
                    detail: invalid.describe(),
                })
            }
        };

        tokio::fs::rename(part, &artifact.path)
            .await
            .map_err(|e| FetchError::io(&artifact.path, e))?;

        Ok(FetchedArtifact {
            name: artifact.name.clone(),
            path: artifact.path.clone(),
            bytes: meta.size,
            resumed_from: progress.resumed_from(),
            duration_ms: 0.0,
        })
    }

    async fn expected_hash(
        &self,
        artifact: &Artifact,
        options: &FetchOptions,
    ) -> Result<Option<ContentHash>, FetchError> {
        if artifact.hash.is_some() {
            return Ok(artifact.hash.clone());
        }
        let Some(checksum_url) = &options.checksum_url else {
            return Ok(None);
        };
        let body = self.source.fetch_text(checksum_url).await?;
        let hash = parse_checksum_body(&body, options.checksum_algorithm).ok_or_else(|| {
            FetchError::Checksum {
                url: checksum_url.clone(),
                message: format!("no {} digest found", options.checksum_algorithm),
            }
        })?;
        debug!(artifact = %artifact.name, %hash, "loaded expected checksum");
        Ok(Some(hash))
    }

    async fn transfer_once(
        &self,
        url: &str,
        part: &Path,
        stall_timeout: Duration,
        progress: &ProgressReporter,
    ) -> Result<Transfer, FetchError> {
        let offset = file_len(part).await?;
        let response = self.source.open(url, offset).await?;

        let mut file = if response.start == offset && offset > 0 {
            debug!(url, offset, "resuming partial download");
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(part)
                .await
                .map_err(|e| FetchError::io(part, e))?
        } else if response.start == 0 {
            if offset > 0 {
                debug!(url, offset, "source did not resume; restarting from zero");
            }
            tokio::fs::File::create(part)
                .await
                .map_err(|e| FetchError::io(part, e))?
        } else {
            return Err(FetchError::Transient {
                url: url.to_string(),
                message: format!("source resumed at byte {}, expected {offset}", response.start),
            });
        };

        progress.begin(response.start, response.total_len);
        let mut position = response.start;
        let mut body = response.body;
        loop {
            let chunk = match tokio::time::timeout(stall_timeout, body.next_chunk()).await {
                Ok(chunk) => chunk?,
                Err(_) => {
                    return Err(FetchError::Transient {
                        url: url.to_string(),
                        message: format!("stalled: no data for {}s", stall_timeout.as_secs()),
                    })
                }
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await.map_err(|e| FetchError::io(part, e))?;
            position += chunk.len() as u64;
            progress.advance(chunk.len() as u64, position);
        }
        file.flush().await.map_err(|e| FetchError::io(part, e))?;
        file.sync_all().await.map_err(|e| FetchError::io(part, e))?;

        if let Some(total) = response.total_len {
            if position < total {
                return Err(FetchError::Transient {
                    url: url.to_string(),
                    message: format!("connection closed at byte {position} of {total}"),
                });
            }
        }

        Ok(Transfer {
            len: position,
            total_len: response.total_len,
        })
    }
}

async fn file_len(path: &Path) -> Result<u64, FetchError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(FetchError::io(path, e)),
    }
}

async fn remove_part(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(part = %part.display(), error = %e, "failed to remove partial download"),
    }
}
