//! Dependency-tracked artifact cache.
//!
//! - [`CompilationContext`] records every resource read during one compile.
//! - [`ArtifactCache`] maps canonical keys to immutable [`CacheEntry`]s and
//!   drops an entry as soon as any member of its dependency set changes.
//! - [`SingleFlight`] runs at most one compile per key, fans the outcome out
//!   to every waiter and rejects work once its admission bound is reached.

mod config;
mod context;
mod flight;
mod store;

use std::sync::Arc;

use thiserror::Error;

use crate::convert::ConversionError;

pub use config::CacheConfig;
pub use context::CompilationContext;
pub use flight::SingleFlight;
pub use store::{ArtifactCache, CacheEntry};

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "hearth_artifact_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "hearth_artifact_cache_miss_total";
pub(crate) const METRIC_CACHE_STALE_TOTAL: &str = "hearth_artifact_cache_stale_total";
pub(crate) const METRIC_COMPILE_MS: &str = "hearth_artifact_compile_ms";
pub(crate) const METRIC_FLIGHT_JOINED_TOTAL: &str = "hearth_flight_joined_total";
pub(crate) const METRIC_FLIGHT_REJECTED_TOTAL: &str = "hearth_flight_rejected_total";
pub(crate) const METRIC_FLIGHT_IN_FLIGHT: &str = "hearth_flight_in_flight";

/// Outcome delivered to every waiter of a compilation.
///
/// Cloned once per waiter, so causes are shared behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("resource `{0}` not found")]
    NotFound(String),
    #[error("failed to compile `{path}`")]
    Conversion {
        path: String,
        #[source]
        source: Arc<ConversionError>,
    },
    #[error("compilation of `{key}` rejected: executor saturated")]
    Rejected { key: String },
    #[error("compilation of `{key}` aborted: {reason}")]
    Aborted { key: String, reason: String },
}

impl CacheError {
    pub(crate) fn conversion(path: impl Into<String>, source: ConversionError) -> Self {
        Self::Conversion {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}
