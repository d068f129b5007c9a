use super::{
    CatalogStore, ExportSource, Locale, NewTranslation, Page, PageRequest, StoreError,
    TranslationFilter, TranslationPatch, TranslationRecord, UpdateOutcome,
};
use crate::locales::LocaleRegistry;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    locales: Vec<Locale>,
    tags: BTreeSet<String>,
    translations: BTreeMap<i64, TranslationRecord>,
    next_translation_id: i64,
}

impl Inner {
    fn locale_by_code(&self, code: &str) -> Option<&Locale> {
        self.locales.iter().find(|locale| locale.code == code)
    }

    fn key_taken(&self, key: &str, except: Option<i64>) -> bool {
        self.translations
            .values()
            .any(|t| t.key == key && Some(t.id) != except)
    }

    fn check_tags(&self, tags: &[String]) -> Result<Vec<String>, StoreError> {
        let missing: Vec<String> = tags
            .iter()
            .filter(|name| !self.tags.contains(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::UnknownTags(missing));
        }
        let unique: BTreeSet<&String> = tags.iter().collect();
        Ok(unique.into_iter().cloned().collect())
    }

    /// Texts for locale codes that do not exist are dropped.
    fn known_texts(&self, texts: BTreeMap<String, String>) -> BTreeMap<String, String> {
        texts
            .into_iter()
            .filter(|(code, _)| self.locale_by_code(code).is_some())
            .collect()
    }
}

/// In-process catalog with the same semantics as the PostgreSQL store.
///
/// Used when no database is configured and as the store behind the test
/// suites.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

impl MemoryCatalog {
    /// A catalog holding the default locales and tags.
    pub fn with_defaults() -> Self {
        let registry = LocaleRegistry::get();
        let inner = Inner {
            locales: registry
                .locales()
                .iter()
                .zip(1..)
                .map(|(config, id)| Locale {
                    id,
                    code: config.code.to_string(),
                    name: config.name.to_string(),
                })
                .collect(),
            tags: registry.tags().iter().map(|tag| tag.to_string()).collect(),
            ..Inner::default()
        };
        Self {
            inner: RwLock::new(inner),
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn matches(record: &TranslationRecord, filter: &TranslationFilter) -> bool {
    if let Some(tag) = &filter.tag {
        if !record.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if let Some(key) = &filter.key {
        if !contains_ci(&record.key, key) {
            return false;
        }
    }
    if let Some(content) = &filter.content {
        let in_texts = record.texts.values().any(|text| contains_ci(text, content));
        if !contains_ci(&record.default_value, content) && !in_texts {
            return false;
        }
    }
    true
}

#[async_trait]
impl ExportSource for MemoryCatalog {
    async fn find_locale(&self, code: &str) -> Result<Option<Locale>, StoreError> {
        Ok(self.inner.read().await.locale_by_code(code).cloned())
    }

    async fn export_rows(&self, locale_id: i64) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.inner.read().await;
        let Some(code) = inner
            .locales
            .iter()
            .find(|locale| locale.id == locale_id)
            .map(|locale| locale.code.as_str())
        else {
            return Ok(Vec::new());
        };

        Ok(inner
            .translations
            .values()
            .filter_map(|t| t.texts.get(code).map(|text| (t.key.clone(), text.clone())))
            .collect())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn list_locales(&self) -> Result<Vec<Locale>, StoreError> {
        Ok(self.inner.read().await.locales.clone())
    }

    async fn list_tags(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().await.tags.iter().cloned().collect())
    }

    async fn list_translations(
        &self,
        filter: &TranslationFilter,
        page: PageRequest,
    ) -> Result<Page<TranslationRecord>, StoreError> {
        let inner = self.inner.read().await;
        let matching: Vec<&TranslationRecord> = inner
            .translations
            .values()
            .filter(|record| matches(record, filter))
            .collect();

        Ok(Page {
            total: matching.len() as u64,
            items: matching
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.per_page as usize)
                .cloned()
                .collect(),
            page: page.page,
            per_page: page.per_page,
        })
    }

    async fn get_translation(&self, id: i64) -> Result<Option<TranslationRecord>, StoreError> {
        Ok(self.inner.read().await.translations.get(&id).cloned())
    }

    async fn create_translation(
        &self,
        new: NewTranslation,
    ) -> Result<TranslationRecord, StoreError> {
        let mut inner = self.inner.write().await;

        if inner.key_taken(&new.key, None) {
            return Err(StoreError::DuplicateKey(new.key));
        }
        let tags = inner.check_tags(&new.tags)?;
        let texts = inner.known_texts(new.texts);

        inner.next_translation_id += 1;
        let now = Utc::now();
        let record = TranslationRecord {
            id: inner.next_translation_id,
            key: new.key,
            default_value: new.default_value,
            texts,
            tags,
            created_at: now,
            updated_at: now,
        };
        inner.translations.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_translation(
        &self,
        id: i64,
        patch: TranslationPatch,
    ) -> Result<Option<UpdateOutcome>, StoreError> {
        let mut inner = self.inner.write().await;

        let Some(before) = inner.translations.get(&id).cloned() else {
            return Ok(None);
        };
        if let Some(key) = &patch.key {
            if inner.key_taken(key, Some(id)) {
                return Err(StoreError::DuplicateKey(key.clone()));
            }
        }
        let tags = match &patch.tags {
            Some(tags) => Some(inner.check_tags(tags)?),
            None => None,
        };
        let texts = patch.texts.map(|texts| inner.known_texts(texts));

        let mut after = before.clone();
        if let Some(key) = patch.key {
            after.key = key;
        }
        if let Some(default_value) = patch.default_value {
            after.default_value = default_value;
        }
        if let Some(texts) = texts {
            after.texts = texts;
        }
        if let Some(tags) = tags {
            after.tags = tags;
        }
        after.updated_at = Utc::now();

        inner.translations.insert(id, after.clone());
        Ok(Some(UpdateOutcome { before, after }))
    }

    async fn delete_translation(&self, id: i64) -> Result<Option<TranslationRecord>, StoreError> {
        Ok(self.inner.write().await.translations.remove(&id))
    }

    async fn upsert_locale(&self, code: &str, name: &str) -> Result<Locale, StoreError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.locales.iter_mut().find(|locale| locale.code == code) {
            existing.name = name.to_string();
            return Ok(existing.clone());
        }
        let locale = Locale {
            id: inner.locales.iter().map(|l| l.id).max().unwrap_or(0) + 1,
            code: code.to_string(),
            name: name.to_string(),
        };
        inner.locales.push(locale.clone());
        Ok(locale)
    }

    async fn upsert_tag(&self, name: &str) -> Result<(), StoreError> {
        self.inner.write().await.tags.insert(name.to_string());
        Ok(())
    }
}
