//! Export cache invalidation on catalog writes.
//!
//! The write path computes a `ChangeSet` from what the store handed back and
//! calls `Invalidator::apply` after the commit, before responding.

use crate::cache::ExportCache;
use crate::metrics::ExportMetrics;
use crate::retry::{with_retry, RetryConfig};
use crate::store::{TranslationRecord, UpdateOutcome};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Locales whose exports a mutation may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSet {
    /// No export can differ (default value or tags only)
    Unaffected,
    /// Exports of these locales may differ. Empty means the affected locales
    /// are unknown, so every export is dropped.
    Locales(BTreeSet<String>),
}

impl ChangeSet {
    pub fn created(record: &TranslationRecord) -> Self {
        Self::Locales(record.locale_codes())
    }

    pub fn updated(outcome: &UpdateOutcome) -> Self {
        let UpdateOutcome { before, after } = outcome;

        // A renamed key moves its entry in every export it appears in
        if before.key != after.key {
            return Self::Locales(&before.locale_codes() | &after.locale_codes());
        }

        let changed: BTreeSet<String> = before
            .locale_codes()
            .union(&after.locale_codes())
            .filter(|code| before.texts.get(*code) != after.texts.get(*code))
            .cloned()
            .collect();

        if changed.is_empty() {
            Self::Unaffected
        } else {
            Self::Locales(changed)
        }
    }

    /// `snapshot` must be read before the row is removed.
    pub fn deleted(snapshot: &TranslationRecord) -> Self {
        Self::Locales(snapshot.locale_codes())
    }
}

/// Applies change sets to the export cache. Never fails the caller: a cache
/// that cannot be reached is logged and left to expire.
pub struct Invalidator {
    cache: Arc<ExportCache>,
    metrics: Arc<ExportMetrics>,
    retry: RetryConfig,
}

impl Invalidator {
    pub fn new(cache: Arc<ExportCache>, metrics: Arc<ExportMetrics>) -> Self {
        Self {
            cache,
            metrics,
            retry: RetryConfig::cache_invalidation(),
        }
    }

    /// Retry policy for the full invalidation fallback.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn apply(&self, change: &ChangeSet) {
        let locales = match change {
            ChangeSet::Unaffected => {
                debug!("Mutation does not touch any export, cache kept");
                return;
            }
            ChangeSet::Locales(locales) if locales.is_empty() => {
                self.invalidate_all("translation has no locale texts").await;
                return;
            }
            ChangeSet::Locales(locales) => locales,
        };

        let mut failed = false;
        for locale in locales {
            match self.cache.invalidate(locale).await {
                Ok(()) => {
                    self.metrics.record_invalidation();
                    debug!(locale = %locale, "Invalidated locale export");
                }
                Err(e) => {
                    failed = true;
                    error!(
                        locale = %locale,
                        error = %e,
                        "Failed to invalidate locale export, consistency risk"
                    );
                }
            }
        }

        if failed {
            self.invalidate_all("targeted invalidation failed").await;
        }
    }

    async fn invalidate_all(&self, reason: &str) {
        let result = with_retry(&self.retry, "Invalidate all locale exports", || {
            self.cache.invalidate_all()
        })
        .await;

        match result {
            Ok(()) => {
                self.metrics.record_full_invalidation();
                info!(reason, "Invalidated every locale export");
            }
            Err(e) => {
                self.metrics.record_invalidation_failure();
                error!(
                    reason,
                    error = %e,
                    ttl_secs = self.cache.ttl().as_secs(),
                    "Full export invalidation failed, consistency risk until cached exports expire"
                );
            }
        }
    }
}
