//! HTTP surface.
//!
//! - `GET /api/v1/export/:locale`: public locale export, rate limited
//! - `/api/v1/translations[/:id]`: catalog CRUD, bearer auth, rate limited
//!   separately from exports
//! - `GET /health`: liveness plus export cache metrics

mod error;
mod export;
mod rate_limit;
mod routes;
mod translations;

pub use error::ApiError;
pub use rate_limit::RateLimiter;
pub use routes::router;
pub use translations::TranslationResource;

use crate::cache::{CacheBackend, ExportCache};
use crate::catalog::CatalogService;
use crate::config::Config;
use crate::export::ExportService;
use crate::invalidation::Invalidator;
use crate::metrics::ExportMetrics;
use crate::store::{CatalogStore, ExportSource};
use std::sync::Arc;

/// Shared handler state. Cloned per request, so every field is a handle.
#[derive(Clone)]
pub struct AppState {
    pub exports: ExportService,
    pub catalog: Arc<CatalogService>,
    pub cache: Arc<ExportCache>,
    pub metrics: Arc<ExportMetrics>,
    pub api_key: Option<Arc<str>>,
    pub crud_limiter: Arc<RateLimiter>,
    pub export_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wire the export read path and the catalog write path around one
    /// store and one cache backend.
    pub fn new<S>(config: &Config, store: Arc<S>, backend: Arc<dyn CacheBackend>) -> Self
    where
        S: CatalogStore + 'static,
    {
        let cache = Arc::new(ExportCache::new(backend, config.export_cache_ttl));
        let metrics = Arc::new(ExportMetrics::new());

        let source: Arc<dyn ExportSource> = store.clone();
        let exports = ExportService::new(
            source,
            cache.clone(),
            metrics.clone(),
            config.export_build_timeout,
        );

        let invalidator = Invalidator::new(cache.clone(), metrics.clone());
        let catalog = Arc::new(CatalogService::new(store, invalidator, config.page_size));

        Self {
            exports,
            catalog,
            cache,
            metrics,
            api_key: config.api_key.as_deref().map(Arc::from),
            crud_limiter: Arc::new(RateLimiter::per_minute(config.crud_rate_limit_per_minute)),
            export_limiter: Arc::new(RateLimiter::per_minute(config.export_rate_limit_per_minute)),
        }
    }
}
