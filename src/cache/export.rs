use super::{export_key, CacheBackend, CacheError, EXPORT_KEY_PREFIX};
use crate::export::ExportMap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Generation snapshot taken before an export build starts.
///
/// `ExportCache::fill` stores the build's result only if neither the locale
/// nor the whole cache was invalidated after the ticket was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillTicket {
    locale: String,
    epoch: u64,
    generation: u64,
}

impl FillTicket {
    pub fn locale(&self) -> &str {
        &self.locale
    }
}

/// Locale-keyed export cache shared by the read path and the invalidator.
pub struct ExportCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    /// Bumped by `invalidate_all`
    epoch: AtomicU64,
    /// Bumped by `invalidate(locale)`
    generations: DashMap<String, u64>,
    /// Fills and single-locale invalidations share it, `invalidate_all` takes it exclusively
    gate: RwLock<()>,
    /// Serializes fills and invalidations of the same locale
    locale_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExportCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            epoch: AtomicU64::new(0),
            generations: DashMap::new(),
            gate: RwLock::new(()),
            locale_locks: DashMap::new(),
        }
    }

    /// Default TTL applied by `fill`.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached export map for `locale`, if present and not expired.
    pub async fn get(&self, locale: &str) -> Result<Option<ExportMap>, CacheError> {
        match self.get_json(locale).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// The cached export exactly as stored (a JSON object).
    pub async fn get_json(&self, locale: &str) -> Result<Option<String>, CacheError> {
        self.backend.get(&export_key(locale)).await
    }

    /// Store `map` for `locale`, replacing any entry and restarting the TTL.
    ///
    /// Unconditional: it does not check for intervening invalidations. The
    /// read path uses `fill` instead.
    pub async fn put(&self, locale: &str, map: &ExportMap, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(map)?;
        self.backend.put(&export_key(locale), json, ttl).await
    }

    /// Remove the entry for `locale`. Removing an absent entry succeeds.
    pub async fn invalidate(&self, locale: &str) -> Result<(), CacheError> {
        let _gate = self.gate.read().await;
        let lock = self.locale_lock(locale);
        let _guard = lock.lock().await;

        // Bump before deleting so in-flight builds are rejected even when
        // the backend call fails.
        *self.generations.entry(locale.to_string()).or_insert(0) += 1;
        self.backend.delete(&export_key(locale)).await
    }

    /// Remove every locale's entry.
    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        let _gate = self.gate.write().await;

        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.backend.delete_prefix(EXPORT_KEY_PREFIX).await
    }

    /// Snapshot the generation of `locale` before building its export.
    pub fn ticket(&self, locale: &str) -> FillTicket {
        FillTicket {
            locale: locale.to_string(),
            epoch: self.epoch.load(Ordering::SeqCst),
            generation: self.generation(locale),
        }
    }

    /// Store a freshly built export unless an invalidation happened since
    /// `ticket` was issued. Returns whether the entry was stored.
    pub async fn fill(&self, ticket: &FillTicket, json: String) -> Result<bool, CacheError> {
        let _gate = self.gate.read().await;
        let lock = self.locale_lock(&ticket.locale);
        let _guard = lock.lock().await;

        if !self.is_current(ticket) {
            return Ok(false);
        }
        self.backend
            .put(&export_key(&ticket.locale), json, self.ttl)
            .await?;
        Ok(true)
    }

    fn is_current(&self, ticket: &FillTicket) -> bool {
        ticket.epoch == self.epoch.load(Ordering::SeqCst)
            && ticket.generation == self.generation(&ticket.locale)
    }

    fn generation(&self, locale: &str) -> u64 {
        self.generations.get(locale).map(|g| *g).unwrap_or(0)
    }

    fn locale_lock(&self, locale: &str) -> Arc<Mutex<()>> {
        self.locale_locks
            .entry(locale.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use async_trait::async_trait;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(3600);

    fn cache() -> ExportCache {
        ExportCache::new(Arc::new(MemoryBackend::new()), TTL)
    }

    fn map(pairs: &[(&str, &str)]) -> ExportMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Backend whose every call fails.
    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let cache = cache();
        let greeting = map(&[("greeting", "Hola")]);

        cache.put("es", &greeting, TTL).await.unwrap();

        assert_eq!(cache.get("es").await.unwrap(), Some(greeting));
        assert_eq!(
            cache.get_json("es").await.unwrap().as_deref(),
            Some(r#"{"greeting":"Hola"}"#)
        );
    }

    #[tokio::test]
    async fn test_locales_are_isolated() {
        let cache = cache();
        cache.put("es", &map(&[("greeting", "Hola")]), TTL).await.unwrap();
        cache.put("fr", &map(&[("greeting", "Bonjour")]), TTL).await.unwrap();

        cache.invalidate("es").await.unwrap();

        assert!(cache.get("es").await.unwrap().is_none());
        assert_eq!(
            cache.get("fr").await.unwrap(),
            Some(map(&[("greeting", "Bonjour")]))
        );
    }

    #[tokio::test]
    async fn test_invalidate_twice_is_noop() {
        let cache = cache();
        cache.put("es", &map(&[("a", "b")]), TTL).await.unwrap();

        cache.invalidate("es").await.unwrap();
        cache.invalidate("es").await.unwrap();
        cache.invalidate("never-cached").await.unwrap();

        assert!(cache.get("es").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_every_locale() {
        let cache = cache();
        for locale in ["en", "es", "fr"] {
            cache.put(locale, &map(&[("k", locale)]), TTL).await.unwrap();
        }

        cache.invalidate_all().await.unwrap();

        for locale in ["en", "es", "fr"] {
            assert!(cache.get(locale).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_fill_with_current_ticket_stores() {
        let cache = cache();
        let ticket = cache.ticket("es");

        let stored = cache
            .fill(&ticket, r#"{"greeting":"Hola"}"#.to_string())
            .await
            .unwrap();

        assert!(stored);
        assert_eq!(cache.get("es").await.unwrap(), Some(map(&[("greeting", "Hola")])));
    }

    #[tokio::test]
    async fn test_fill_uses_configured_ttl() {
        let cache = ExportCache::new(Arc::new(MemoryBackend::new()), Duration::from_millis(30));
        let ticket = cache.ticket("es");

        assert!(cache.fill(&ticket, "{}".to_string()).await.unwrap());
        assert!(cache.get_json("es").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get_json("es").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fill_after_invalidate_is_rejected() {
        let cache = cache();
        let ticket = cache.ticket("es");

        // A mutation lands while the build is running
        cache.invalidate("es").await.unwrap();

        let stored = cache
            .fill(&ticket, r#"{"greeting":"stale"}"#.to_string())
            .await
            .unwrap();
        assert!(!stored);
        assert!(cache.get("es").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fill_after_invalidate_all_is_rejected() {
        let cache = cache();
        let ticket = cache.ticket("es");

        cache.invalidate_all().await.unwrap();

        assert!(!cache.fill(&ticket, "{}".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_of_other_locale_does_not_reject_fill() {
        let cache = cache();
        let ticket = cache.ticket("es");

        cache.invalidate("fr").await.unwrap();

        assert!(cache.fill(&ticket, "{}".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_invalidate_still_rejects_inflight_fill() {
        let cache = ExportCache::new(Arc::new(DownBackend), TTL);
        let ticket = cache.ticket("es");

        assert!(cache.invalidate("es").await.is_err());

        // Rejected before the backend is even called
        assert!(!cache.fill(&ticket, "{}".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_errors_propagate() {
        let cache = ExportCache::new(Arc::new(DownBackend), TTL);

        assert!(matches!(
            cache.get("es").await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache.invalidate_all().await.is_err());
    }

    fn export_map_strategy() -> impl Strategy<Value = ExportMap> {
        prop::collection::btree_map("[a-z][a-z0-9_.]{0,20}", ".{0,40}", 0..30)
    }

    proptest! {
        #[test]
        fn prop_put_then_get_returns_map(locale in "[a-z]{2}", export in export_map_strategy()) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let fetched = rt.block_on(async {
                let cache = cache();
                cache.put(&locale, &export, TTL).await.unwrap();
                cache.get(&locale).await.unwrap()
            });
            prop_assert_eq!(fetched, Some(export));
        }

        #[test]
        fn prop_invalidate_is_idempotent(locale in "[a-z]{2}", export in export_map_strategy(), times in 1usize..4) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let fetched = rt.block_on(async {
                let cache = cache();
                cache.put(&locale, &export, TTL).await.unwrap();
                for _ in 0..times {
                    cache.invalidate(&locale).await.unwrap();
                }
                cache.get(&locale).await.unwrap()
            });
            prop_assert_eq!(fetched, None);
        }
    }
}
