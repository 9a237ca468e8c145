//! Watermark-based cache reconciliation.

use super::CacheDomain;
use crate::core::Artifact;
use crate::errors::GeoflowError;
use crate::events::{names, EventSink};
use crate::state::StateStore;
use crate::utils::unix_nanos;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of reconciling a cache domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The domain was stale and has been cleared.
    Cleared,
    /// The domain is consistent with its upstream artifacts.
    Fresh,
}

/// Clears cache domains whose upstream artifacts changed.
pub struct CacheInvalidator {
    state: Arc<StateStore>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInvalidator").finish_non_exhaustive()
    }
}

impl CacheInvalidator {
    /// Creates an invalidator backed by the persisted run state.
    #[must_use]
    pub fn new(state: Arc<StateStore>, events: Arc<dyn EventSink>) -> Self {
        Self { state, events }
    }

    /// Clears `domain` if an upstream artifact is newer than its watermark.
    ///
    /// With no watermark yet, the domain is cleared as soon as any upstream
    /// artifact exists. The watermark only ever moves forward, so a domain
    /// is never cleared twice for the same upstream timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`GeoflowError::CacheFailed`] if the directory could not be
    /// cleared (the domain is then left untouched), or a state error if the
    /// watermark could not be persisted.
    pub async fn reconcile(
        &self,
        domain: &CacheDomain,
        upstream: &[&Artifact],
    ) -> Result<ReconcileOutcome, GeoflowError> {
        let Some(newest) = newest_mtime_ns(upstream).await else {
            debug!(domain = %domain.name, "no upstream artifact exists yet");
            return Ok(ReconcileOutcome::Fresh);
        };

        let stale = self
            .state
            .watermark(&domain.name)
            .map_or(true, |w| newest > w.upstream_mtime_ns);
        if !stale {
            debug!(domain = %domain.name, "cache is fresh");
            return Ok(ReconcileOutcome::Fresh);
        }

        self.clear(domain).await?;
        self.state.set_watermark(&domain.name, newest)?;
        self.events
            .emit(
                names::CACHE_CLEARED,
                Some(json!({ "domain": domain.name, "path": domain.path, "reason": "upstream changed" })),
            )
            .await;
        Ok(ReconcileOutcome::Cleared)
    }

    /// Clears `domain` unconditionally and raises its watermark to the
    /// newest upstream timestamp.
    ///
    /// # Errors
    ///
    /// Same as [`reconcile`](Self::reconcile).
    pub async fn invalidate(&self, domain: &CacheDomain, upstream: &[&Artifact]) -> Result<(), GeoflowError> {
        self.clear(domain).await?;

        let current = self
            .state
            .watermark(&domain.name)
            .map_or(0, |w| w.upstream_mtime_ns);
        let newest = newest_mtime_ns(upstream).await.unwrap_or(0);
        self.state.set_watermark(&domain.name, current.max(newest))?;
        self.events
            .emit(
                names::CACHE_CLEARED,
                Some(json!({ "domain": domain.name, "path": domain.path, "reason": "operator request" })),
            )
            .await;
        Ok(())
    }

    /// Swaps the directory for an empty one, then deletes the old contents.
    async fn clear(&self, domain: &CacheDomain) -> Result<(), GeoflowError> {
        let failed = |reason: String| GeoflowError::CacheFailed {
            domain: domain.name.clone(),
            reason,
        };

        match tokio::fs::metadata(&domain.path).await {
            Ok(md) if md.is_dir() => {}
            Ok(_) => {
                return Err(failed(format!("{} is not a directory", domain.path.display())));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&domain.path)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                info!(domain = %domain.name, path = %domain.path.display(), "created empty cache directory");
                return Ok(());
            }
            Err(e) => return Err(failed(e.to_string())),
        }

        let trash = trash_path(&domain.path);
        tokio::fs::rename(&domain.path, &trash).await.map_err(|e| {
            failed(format!(
                "could not move {} aside: {e}; cache left untouched",
                domain.path.display()
            ))
        })?;
        tokio::fs::create_dir_all(&domain.path).await.map_err(|e| {
            failed(format!(
                "cleared, but could not recreate {}: {e}; old contents are in {}",
                domain.path.display(),
                trash.display()
            ))
        })?;

        if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
            warn!(domain = %domain.name, trash = %trash.display(), error = %e, "could not delete old cache contents");
        }
        info!(domain = %domain.name, path = %domain.path.display(), "cache cleared");
        Ok(())
    }
}

fn trash_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.trash-{}", Uuid::now_v7().simple()))
}

async fn newest_mtime_ns(upstream: &[&Artifact]) -> Option<u64> {
    let mut newest = None;
    for artifact in upstream {
        if let Ok(Some(meta)) = artifact.stat().await {
            newest = newest.max(Some(unix_nanos(meta.modified)));
        }
    }
    newest
}
