//! Derived-cache invalidation.
//!
//! A [`CacheDomain`] is a directory of data derived from upstream artifacts
//! (rendered tiles, query caches). Whenever an upstream artifact is newer
//! than the domain's persisted watermark, the directory is cleared before it
//! is served again.

mod domain;
mod invalidator;

pub use domain::CacheDomain;
pub use invalidator::{CacheInvalidator, ReconcileOutcome};
