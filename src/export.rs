//! Locale export: build the key → text map for one locale and serve it
//! through the export cache.
//!
//! Read path: cache hit → respond; miss → build (one build per locale at a
//! time, concurrent misses wait for it) → fill the cache → respond.

use crate::cache::{ExportCache, FillTicket};
use crate::metrics::ExportMetrics;
use crate::store::{ExportSource, StoreError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Sparse translation key → translated text mapping for one locale.
///
/// Keys without text for the locale are absent; there is no fallback to the
/// default value.
pub type ExportMap = BTreeMap<String, String>;

/// A serialized export, shared between the cache, coalesced waiters and the
/// HTTP response without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    json: Arc<str>,
}

impl Export {
    pub fn from_map(map: &ExportMap) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(serde_json::to_string(map)?))
    }

    fn from_json(json: String) -> Self {
        Self { json: json.into() }
    }

    /// The export as a JSON object string.
    pub fn as_json(&self) -> &str {
        &self.json
    }

    pub fn to_map(&self) -> Result<ExportMap, serde_json::Error> {
        serde_json::from_str(&self.json)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("locale '{0}' not found")]
    LocaleNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the export read path. `Clone` so one failed build can
/// be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum ExportError {
    #[error("locale '{0}' not found")]
    LocaleNotFound(String),

    #[error("export build failed: {0}")]
    BuildFailure(String),

    #[error("export build exceeded {0:?}")]
    BuildTimeout(Duration),
}

/// Builds a locale's export map from the catalog store.
pub struct ExportBuilder {
    source: Arc<dyn ExportSource>,
}

impl ExportBuilder {
    pub fn new(source: Arc<dyn ExportSource>) -> Self {
        Self { source }
    }

    /// One locale lookup followed by a single projection over the locale's
    /// texts. Unknown locales are an error, never an empty map.
    pub async fn build(&self, code: &str) -> Result<ExportMap, BuildError> {
        let locale = self
            .source
            .find_locale(code)
            .await?
            .ok_or_else(|| BuildError::LocaleNotFound(code.to_string()))?;

        let rows = self.source.export_rows(locale.id).await?;
        Ok(rows.into_iter().collect())
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<Export, ExportError>>>;

/// A build in progress for one locale, tagged with the cache generation it
/// started from.
struct Flight {
    ticket: FillTicket,
    build: SharedBuild,
}

/// Cached, single-flight export reads.
#[derive(Clone)]
pub struct ExportService {
    builder: Arc<ExportBuilder>,
    cache: Arc<ExportCache>,
    metrics: Arc<ExportMetrics>,
    flights: Arc<DashMap<String, Flight>>,
    build_timeout: Duration,
}

impl ExportService {
    pub fn new(
        source: Arc<dyn ExportSource>,
        cache: Arc<ExportCache>,
        metrics: Arc<ExportMetrics>,
        build_timeout: Duration,
    ) -> Self {
        Self {
            builder: Arc::new(ExportBuilder::new(source)),
            cache,
            metrics,
            flights: Arc::new(DashMap::new()),
            build_timeout,
        }
    }

    /// The export for `locale`, from the cache when possible.
    pub async fn export(&self, locale: &str) -> Result<Export, ExportError> {
        match self.cache.get_json(locale).await {
            Ok(Some(json)) => {
                self.metrics.record_cache_hit();
                debug!(locale, "Export cache hit");
                return Ok(Export::from_json(json));
            }
            Ok(None) => {
                self.metrics.record_cache_miss();
                debug!(locale, "Export cache miss");
            }
            Err(e) => {
                // Degrade to an uncached build rather than failing the read
                self.metrics.record_cache_bypass();
                warn!(locale, error = %e, "Export cache unavailable, building from the store");
                return self.build(locale).await;
            }
        }

        self.coalesced_build(locale).await
    }

    /// Join the build already running for `locale`, or start one.
    ///
    /// A running build is only joined when no invalidation happened since it
    /// started; otherwise a fresh build replaces it.
    async fn coalesced_build(&self, locale: &str) -> Result<Export, ExportError> {
        let ticket = self.cache.ticket(locale);

        let build = match self.flights.entry(locale.to_string()) {
            Entry::Occupied(entry) if entry.get().ticket == ticket => {
                self.metrics.record_coalesced();
                debug!(locale, "Waiting for in-flight export build");
                entry.get().build.clone()
            }
            entry => {
                // Spawned so the build finishes and fills the cache even if
                // every caller disconnects
                let task = tokio::spawn(self.clone().lead(ticket.clone()));
                let build = task
                    .map(|joined| {
                        joined.unwrap_or_else(|e| {
                            error!(error = %e, "Export build task failed");
                            Err(ExportError::BuildFailure(e.to_string()))
                        })
                    })
                    .boxed()
                    .shared();
                entry.insert(Flight {
                    ticket,
                    build: build.clone(),
                });
                build
            }
        };

        build.await
    }

    /// Build, fill the cache if still current, and retire the flight.
    /// Runs as its own task.
    async fn lead(self, ticket: FillTicket) -> Result<Export, ExportError> {
        let result = self.build(ticket.locale()).await;

        if let Ok(export) = &result {
            match self.cache.fill(&ticket, export.as_json().to_string()).await {
                Ok(true) => debug!(locale = ticket.locale(), "Export cached"),
                Ok(false) => debug!(
                    locale = ticket.locale(),
                    "Export invalidated during build, not cached"
                ),
                Err(e) => warn!(
                    locale = ticket.locale(),
                    error = %e,
                    "Failed to cache export"
                ),
            }
        }

        self.flights
            .remove_if(ticket.locale(), |_, flight| flight.ticket == ticket);
        result
    }

    /// Run the builder under the latency budget.
    async fn build(&self, locale: &str) -> Result<Export, ExportError> {
        self.metrics.record_build();
        let started = Instant::now();

        let map = match tokio::time::timeout(self.build_timeout, self.builder.build(locale)).await {
            Ok(Ok(map)) => map,
            Ok(Err(BuildError::LocaleNotFound(code))) => {
                debug!(locale, "Export requested for unknown locale");
                return Err(ExportError::LocaleNotFound(code));
            }
            Ok(Err(BuildError::Store(e))) => {
                self.metrics.record_build_failure();
                error!(locale, error = %e, "Export build failed");
                return Err(ExportError::BuildFailure(e.to_string()));
            }
            Err(_) => {
                self.metrics.record_build_failure();
                error!(
                    locale,
                    timeout_ms = self.build_timeout.as_millis() as u64,
                    "Export build timed out"
                );
                return Err(ExportError::BuildTimeout(self.build_timeout));
            }
        };

        let export = Export::from_map(&map).map_err(|e| {
            self.metrics.record_build_failure();
            ExportError::BuildFailure(e.to_string())
        })?;

        info!(
            locale,
            keys = map.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built locale export"
        );
        Ok(export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CacheError, MemoryBackend};
    use crate::store::{CatalogStore, Locale, MemoryCatalog, NewTranslation};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(3600);
    const BUDGET: Duration = Duration::from_secs(2);

    /// Fixed catalog with one locale, counting projections.
    struct FakeSource {
        rows: Vec<(String, String)>,
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn with_rows(rows: &[(&str, &str)]) -> Self {
            Self {
                rows: rows
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                delay: Duration::ZERO,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExportSource for FakeSource {
        async fn find_locale(&self, code: &str) -> Result<Option<Locale>, StoreError> {
            Ok((code == "es").then(|| Locale {
                id: 3,
                code: "es".to_string(),
                name: "Spanish".to_string(),
            }))
        }

        async fn export_rows(&self, _locale_id: i64) -> Result<Vec<(String, String)>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            Ok(self.rows.clone())
        }
    }

    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("timeout".to_string()))
        }
        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("timeout".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("timeout".to_string()))
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("timeout".to_string()))
        }
    }

    struct Fixture {
        source: Arc<FakeSource>,
        cache: Arc<ExportCache>,
        metrics: Arc<ExportMetrics>,
        service: ExportService,
    }

    fn fixture(source: FakeSource, budget: Duration) -> Fixture {
        let source = Arc::new(source);
        let cache = Arc::new(ExportCache::new(Arc::new(MemoryBackend::new()), TTL));
        let metrics = Arc::new(ExportMetrics::new());
        let service = ExportService::new(source.clone(), cache.clone(), metrics.clone(), budget);
        Fixture {
            source,
            cache,
            metrics,
            service,
        }
    }

    fn new_translation(key: &str, texts: &[(&str, &str)]) -> NewTranslation {
        NewTranslation {
            key: key.to_string(),
            default_value: key.to_string(),
            texts: texts
                .iter()
                .map(|(code, text)| (code.to_string(), text.to_string()))
                .collect(),
            tags: vec![],
        }
    }

    // ==================== Builder Tests ====================

    #[tokio::test]
    async fn test_build_is_sparse() {
        let catalog = Arc::new(MemoryCatalog::with_defaults());
        catalog
            .create_translation(new_translation("greeting", &[("es", "Hola"), ("fr", "Bonjour")]))
            .await
            .unwrap();
        catalog
            .create_translation(new_translation("farewell", &[("fr", "Au revoir")]))
            .await
            .unwrap();

        let builder = ExportBuilder::new(catalog);
        let export = builder.build("es").await.unwrap();

        assert_eq!(
            export,
            ExportMap::from([("greeting".to_string(), "Hola".to_string())])
        );
    }

    #[tokio::test]
    async fn test_build_existing_locale_without_texts_is_empty() {
        let builder = ExportBuilder::new(Arc::new(MemoryCatalog::with_defaults()));
        assert!(builder.build("de").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_unknown_locale_fails() {
        let builder = ExportBuilder::new(Arc::new(MemoryCatalog::with_defaults()));
        assert!(matches!(
            builder.build("xx").await,
            Err(BuildError::LocaleNotFound(code)) if code == "xx"
        ));
    }

    // ==================== Read Path Tests ====================

    #[tokio::test]
    async fn test_miss_builds_and_fills_then_hits() {
        let fx = fixture(FakeSource::with_rows(&[("greeting", "Hola")]), BUDGET);

        let first = fx.service.export("es").await.unwrap();
        let second = fx.service.export("es").await.unwrap();

        assert_eq!(first.as_json(), r#"{"greeting":"Hola"}"#);
        assert_eq!(first, second);
        assert_eq!(fx.source.calls(), 1);
        assert_eq!(fx.metrics.cache_misses(), 1);
        assert_eq!(fx.metrics.cache_hits(), 1);
        assert!(fx.cache.get("es").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_locale_is_not_cached() {
        let fx = fixture(FakeSource::with_rows(&[]), BUDGET);

        let result = fx.service.export("xx").await;

        assert!(matches!(result, Err(ExportError::LocaleNotFound(_))));
        assert!(fx.cache.get_json("xx").await.unwrap().is_none());
        assert_eq!(fx.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_not_cached() {
        let fx = fixture(FakeSource::with_rows(&[("a", "b")]).failing(), BUDGET);

        let result = fx.service.export("es").await;

        assert!(matches!(result, Err(ExportError::BuildFailure(_))));
        assert!(fx.cache.get_json("es").await.unwrap().is_none());
        assert_eq!(fx.metrics.report().build_failures, 1);
    }

    #[tokio::test]
    async fn test_slow_build_times_out_and_caches_nothing() {
        let fx = fixture(
            FakeSource::with_rows(&[("a", "b")]).slow(Duration::from_millis(300)),
            Duration::from_millis(20),
        );

        let result = fx.service.export("es").await;

        assert!(matches!(result, Err(ExportError::BuildTimeout(_))));
        assert!(fx.cache.get_json("es").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_outage_degrades_to_direct_build() {
        let source = Arc::new(FakeSource::with_rows(&[("greeting", "Hola")]));
        let cache = Arc::new(ExportCache::new(Arc::new(DownBackend), TTL));
        let metrics = Arc::new(ExportMetrics::new());
        let service = ExportService::new(source.clone(), cache, metrics.clone(), BUDGET);

        let export = service.export("es").await.unwrap();

        assert_eq!(export.as_json(), r#"{"greeting":"Hola"}"#);
        assert_eq!(metrics.report().cache_bypasses, 1);
    }

    // ==================== Single-Flight Tests ====================

    #[tokio::test]
    async fn test_concurrent_misses_share_one_build() {
        let fx = fixture(
            FakeSource::with_rows(&[("greeting", "Hola")]).slow(Duration::from_millis(50)),
            BUDGET,
        );

        let reads = (0..10).map(|_| fx.service.export("es"));
        let results = futures::future::join_all(reads).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(fx.source.calls(), 1);
        assert_eq!(fx.metrics.report().coalesced, 9);
        assert!(fx.service.flights.is_empty());
    }

    #[tokio::test]
    async fn test_build_overtaken_by_invalidation_is_not_cached() {
        let fx = fixture(
            FakeSource::with_rows(&[("greeting", "Hola")]).slow(Duration::from_millis(50)),
            BUDGET,
        );

        let service = fx.service.clone();
        let read = tokio::spawn(async move { service.export("es").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.cache.invalidate("es").await.unwrap();

        assert!(read.await.unwrap().is_ok());
        assert!(fx.cache.get_json("es").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_after_invalidation_does_not_join_stale_build() {
        let fx = fixture(
            FakeSource::with_rows(&[("greeting", "Hola")]).slow(Duration::from_millis(50)),
            BUDGET,
        );

        let service = fx.service.clone();
        let stale = tokio::spawn(async move { service.export("es").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.cache.invalidate("es").await.unwrap();

        let fresh = fx.service.export("es").await;

        assert!(fresh.is_ok());
        assert!(stale.await.unwrap().is_ok());
        assert_eq!(fx.source.calls(), 2);
        // Only the post-invalidation build may populate the cache
        assert!(fx.cache.get_json("es").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_build_completes_after_caller_disconnects() {
        let fx = fixture(
            FakeSource::with_rows(&[("greeting", "Hola")]).slow(Duration::from_millis(50)),
            Duration::from_millis(300),
        );

        // The only caller gives up mid-build
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), fx.service.export("es")).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.service.flights.is_empty());
        assert!(fx.cache.get_json("es").await.unwrap().is_some());

        let next = fx.service.export("es").await.unwrap();
        assert_eq!(next.as_json(), r#"{"greeting":"Hola"}"#);
        assert_eq!(fx.source.calls(), 1);
    }

    // ==================== Expiry Tests ====================

    #[tokio::test]
    async fn test_expired_export_is_rebuilt() {
        let source = Arc::new(FakeSource::with_rows(&[("greeting", "Hola")]));
        let cache = Arc::new(ExportCache::new(
            Arc::new(MemoryBackend::new()),
            Duration::from_millis(40),
        ));
        let metrics = Arc::new(ExportMetrics::new());
        let service = ExportService::new(source.clone(), cache.clone(), metrics.clone(), BUDGET);

        service.export("es").await.unwrap();
        service.export("es").await.unwrap();
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get_json("es").await.unwrap().is_none());

        service.export("es").await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(metrics.cache_misses(), 2);
        assert!(cache.get_json("es").await.unwrap().is_some());
    }

    // ==================== Property Tests ====================

    proptest! {
        #[test]
        fn prop_export_contains_exactly_keys_with_text(
            entries in prop::collection::btree_map("[a-z]{1,8}", proptest::option::of("[A-Za-z ]{1,12}"), 0..20)
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let exported = rt.block_on(async {
                let catalog = Arc::new(MemoryCatalog::with_defaults());
                for (key, text) in &entries {
                    let texts = match text {
                        Some(text) => vec![("es", text.as_str())],
                        None => vec![("fr", "texte")],
                    };
                    catalog
                        .create_translation(new_translation(key, &texts))
                        .await
                        .unwrap();
                }
                ExportBuilder::new(catalog).build("es").await.unwrap()
            });

            let expected: ExportMap = entries
                .into_iter()
                .filter_map(|(key, text)| text.map(|text| (key, text)))
                .collect();
            prop_assert_eq!(exported, expected);
        }
    }
}
