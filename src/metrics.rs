//! Export cache metrics and observability.
//!
//! Counters are plain atomics owned by the application state rather than a
//! process-wide singleton, so each test server sees its own numbers.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters for the export read path and the invalidation protocol.
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Exports answered straight from the cache
    cache_hits: AtomicUsize,

    /// Exports that found no cache entry
    cache_misses: AtomicUsize,

    /// Reads that skipped the cache because the backend failed
    cache_bypasses: AtomicUsize,

    /// Builds that ran against the catalog store
    builds: AtomicUsize,

    /// Builds that failed (store error or timeout)
    build_failures: AtomicUsize,

    /// Misses that were satisfied by another request's build
    coalesced: AtomicUsize,

    /// Single-locale invalidations
    invalidations: AtomicUsize,

    /// Full (all-locale) invalidations
    full_invalidations: AtomicUsize,

    /// Invalidations that could not reach the cache backend
    invalidation_failures: AtomicUsize,
}

impl ExportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_bypass(&self) {
        self.cache_bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_failure(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_full_invalidation(&self) {
        self.full_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation_failure(&self) {
        self.invalidation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> usize {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn full_invalidations(&self) -> usize {
        self.full_invalidations.load(Ordering::Relaxed)
    }

    pub fn invalidation_failures(&self) -> usize {
        self.invalidation_failures.load(Ordering::Relaxed)
    }

    /// Generate a metrics report.
    pub fn report(&self) -> MetricsReport {
        let hits = self.cache_hits();
        let misses = self.cache_misses();
        let lookups = hits + misses;
        let cache_hit_rate = if lookups > 0 {
            (hits as f64 / lookups as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate,
            cache_bypasses: self.cache_bypasses.load(Ordering::Relaxed),
            builds: self.builds(),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            full_invalidations: self.full_invalidations(),
            invalidation_failures: self.invalidation_failures(),
        }
    }
}

/// Snapshot of the export metrics, served by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Percentage of lookups answered from the cache (0.0 - 100.0)
    pub cache_hit_rate: f64,
    pub cache_bypasses: usize,
    pub builds: usize,
    pub build_failures: usize,
    pub coalesced: usize,
    pub invalidations: usize,
    pub full_invalidations: usize,
    pub invalidation_failures: usize,
}

impl MetricsReport {
    /// One-line summary for logs.
    pub fn format(&self) -> String {
        format!(
            "Export cache: {} hits, {} misses ({:.1}% hit rate), {} builds ({} failed), {} invalidations ({} full, {} failed)",
            self.cache_hits,
            self.cache_misses,
            self.cache_hit_rate,
            self.builds,
            self.build_failures,
            self.invalidations,
            self.full_invalidations,
            self.invalidation_failures
        )
    }
}
