//! Export cache: locale → serialized export map, with TTL and invalidation.
//!
//! - `CacheBackend`: the key-value store (in-process or shared)
//! - `MemoryBackend`: DashMap-backed in-process backend
//! - `ExportCache`: the locale-keyed handle the export service and the
//!   invalidator share; it owns key formatting, serialization and the
//!   generation bookkeeping that keeps late builds from resurrecting
//!   invalidated entries

mod export;
mod memory;

pub use export::{ExportCache, FillTicket};
pub use memory::MemoryBackend;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every export cache key.
pub const EXPORT_KEY_PREFIX: &str = "export:";

/// Cache key for a locale's export: `export:<locale-code>`.
pub fn export_key(locale: &str) -> String {
    format!("{}{}", EXPORT_KEY_PREFIX, locale)
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value store behind the export cache.
///
/// Every operation replaces or deletes a whole value, so implementations
/// only need atomic per-key writes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// The value stored under `key`, unless absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`, replacing any previous entry and restarting its TTL.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_key_format() {
        assert_eq!(export_key("es"), "export:es");
        assert_eq!(export_key("pt-BR"), "export:pt-BR");
        assert!(export_key("fr").starts_with(EXPORT_KEY_PREFIX));
    }
}
