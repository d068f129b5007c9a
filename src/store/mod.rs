//! Catalog storage: translations, locales, per-locale text and tags.
//!
//! # Architecture
//!
//! - `ExportSource`: the two read operations the export builder needs
//! - `CatalogStore`: the full CRUD surface used by the write path
//! - `postgres`: sqlx/PostgreSQL implementation
//! - `memory`: in-process implementation for development and tests
//!
//! Mutations return the state the invalidation protocol needs: updates hand
//! back the record before and after the change, deletes hand back the
//! snapshot taken before the row was removed.

mod memory;
mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A supported language/region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Locale {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// A translation key with its default value, per-locale texts and tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationRecord {
    pub id: i64,
    pub key: String,
    pub default_value: String,
    /// Locale code → translated text
    pub texts: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TranslationRecord {
    /// Codes of every locale this translation has text for.
    pub fn locale_codes(&self) -> BTreeSet<String> {
        self.texts.keys().cloned().collect()
    }
}

/// Input for creating a translation.
#[derive(Debug, Clone, Default)]
pub struct NewTranslation {
    pub key: String,
    pub default_value: String,
    pub texts: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

/// Partial update. `None` fields are left untouched; `Some` collections
/// replace the existing set entirely.
#[derive(Debug, Clone, Default)]
pub struct TranslationPatch {
    pub key: Option<String>,
    pub default_value: Option<String>,
    pub texts: Option<BTreeMap<String, String>>,
    pub tags: Option<Vec<String>>,
}

/// Result of an update: the record as it was and as it is now.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub before: TranslationRecord,
    pub after: TranslationRecord,
}

/// List filters. All filters are combined with AND.
#[derive(Debug, Clone, Default)]
pub struct TranslationFilter {
    /// Exact tag name
    pub tag: Option<String>,
    /// Case-insensitive substring of the key
    pub key: Option<String>,
    /// Case-insensitive substring of the default value or any translated text
    pub content: Option<String>,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page)
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    pub fn last_page(&self) -> u64 {
        if self.per_page == 0 {
            return 1;
        }
        self.total.div_ceil(u64::from(self.per_page)).max(1)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("translation key '{0}' already exists")]
    DuplicateKey(String),

    #[error("unknown tags: {}", .0.join(", "))]
    UnknownTags(Vec<String>),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("catalog store unavailable: {0}")]
    Unavailable(String),
}

/// Read operations behind the locale export.
#[async_trait]
pub trait ExportSource: Send + Sync {
    /// Look up a locale by its code.
    async fn find_locale(&self, code: &str) -> Result<Option<Locale>, StoreError>;

    /// All (key, text) pairs that have text for the locale. Translations
    /// without text for it produce no row.
    async fn export_rows(&self, locale_id: i64) -> Result<Vec<(String, String)>, StoreError>;
}

/// Full catalog surface used by the write path and seeding.
#[async_trait]
pub trait CatalogStore: ExportSource {
    async fn list_locales(&self) -> Result<Vec<Locale>, StoreError>;

    async fn list_tags(&self) -> Result<Vec<String>, StoreError>;

    async fn list_translations(
        &self,
        filter: &TranslationFilter,
        page: PageRequest,
    ) -> Result<Page<TranslationRecord>, StoreError>;

    async fn get_translation(&self, id: i64) -> Result<Option<TranslationRecord>, StoreError>;

    /// Insert a translation with its texts and tags in one transaction.
    /// Texts for locale codes that do not exist are dropped.
    async fn create_translation(
        &self,
        new: NewTranslation,
    ) -> Result<TranslationRecord, StoreError>;

    /// Apply a patch in one transaction. `Ok(None)` when the id is unknown.
    async fn update_translation(
        &self,
        id: i64,
        patch: TranslationPatch,
    ) -> Result<Option<UpdateOutcome>, StoreError>;

    /// Delete a translation, returning the snapshot taken before removal.
    async fn delete_translation(&self, id: i64) -> Result<Option<TranslationRecord>, StoreError>;

    /// Insert a locale or rename an existing one.
    async fn upsert_locale(&self, code: &str, name: &str) -> Result<Locale, StoreError>;

    async fn upsert_tag(&self, name: &str) -> Result<(), StoreError>;
}

/// Escape `%`, `_` and `\` so user input matches literally inside LIKE.
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}
