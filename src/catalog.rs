//! Catalog write path: validation, store mutation, then export invalidation.
//!
//! Every mutation commits in the store first and invalidates the affected
//! locale exports before returning, so a read issued after a write never
//! sees the pre-write export.

use crate::invalidation::{ChangeSet, Invalidator};
use crate::store::{
    CatalogStore, NewTranslation, Page, PageRequest, StoreError, TranslationFilter,
    TranslationPatch, TranslationRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Longest accepted translation key, in characters.
pub const MAX_KEY_LEN: usize = 255;

/// Field → messages, serialized as the `errors` object of a 422 response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    fn single(field: &str, message: &str) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    fn into_result(self) -> Result<(), CatalogError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CatalogError::Validation(self))
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("validation failed on {}", .0.fields.keys().cloned().collect::<Vec<_>>().join(", "))]
    Validation(ValidationErrors),

    #[error("translation {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(_) => Self::Validation(ValidationErrors::single(
                "key",
                "The key has already been taken.",
            )),
            StoreError::UnknownTags(_) => Self::Validation(ValidationErrors::single(
                "tags",
                "The selected tags are invalid.",
            )),
            other => Self::Store(other),
        }
    }
}

/// Request body for create and update. Fields are kept as raw JSON so type
/// mismatches are reported per field instead of rejecting the whole body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranslationInput {
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub translations: Option<Value>,
    #[serde(default)]
    pub tags: Option<Value>,
}

/// Input fields after type and shape checks.
#[derive(Debug, Default)]
struct Validated {
    key: Option<String>,
    default_value: Option<String>,
    texts: Option<BTreeMap<String, String>>,
    tags: Option<Vec<String>>,
}

pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    invalidator: Invalidator,
    page_size: u32,
}

impl CatalogService {
    pub fn new(store: Arc<dyn CatalogStore>, invalidator: Invalidator, page_size: u32) -> Self {
        Self {
            store,
            invalidator,
            page_size: page_size.max(1),
        }
    }

    pub async fn list(
        &self,
        filter: &TranslationFilter,
        page: u32,
    ) -> Result<Page<TranslationRecord>, CatalogError> {
        let request = PageRequest {
            page: page.max(1),
            per_page: self.page_size,
        };
        Ok(self.store.list_translations(filter, request).await?)
    }

    pub async fn get(&self, id: i64) -> Result<TranslationRecord, CatalogError> {
        self.store
            .get_translation(id)
            .await?
            .ok_or(CatalogError::NotFound(id))
    }

    pub async fn create(&self, input: TranslationInput) -> Result<TranslationRecord, CatalogError> {
        let validated = self.validate(&input, true).await?;

        let new = NewTranslation {
            key: validated.key.unwrap_or_default(),
            default_value: validated.default_value.unwrap_or_default(),
            texts: self.known_locales_only(validated.texts.unwrap_or_default()).await?,
            tags: validated.tags.unwrap_or_default(),
        };

        let record = self.store.create_translation(new).await?;
        info!(id = record.id, key = %record.key, "Created translation");

        self.invalidator.apply(&ChangeSet::created(&record)).await;
        Ok(record)
    }

    pub async fn update(
        &self,
        id: i64,
        input: TranslationInput,
    ) -> Result<TranslationRecord, CatalogError> {
        // Unknown ids are a 404 before any validation
        self.get(id).await?;

        let validated = self.validate(&input, false).await?;
        let texts = match validated.texts {
            Some(texts) => Some(self.known_locales_only(texts).await?),
            None => None,
        };
        let patch = TranslationPatch {
            key: validated.key,
            default_value: validated.default_value,
            texts,
            tags: validated.tags,
        };

        let outcome = self
            .store
            .update_translation(id, patch)
            .await?
            .ok_or(CatalogError::NotFound(id))?;
        info!(id, key = %outcome.after.key, "Updated translation");

        self.invalidator.apply(&ChangeSet::updated(&outcome)).await;
        Ok(outcome.after)
    }

    pub async fn delete(&self, id: i64) -> Result<(), CatalogError> {
        let snapshot = self
            .store
            .delete_translation(id)
            .await?
            .ok_or(CatalogError::NotFound(id))?;
        info!(id, key = %snapshot.key, "Deleted translation");

        self.invalidator.apply(&ChangeSet::deleted(&snapshot)).await;
        Ok(())
    }

    async fn validate(
        &self,
        input: &TranslationInput,
        creating: bool,
    ) -> Result<Validated, CatalogError> {
        let mut errors = ValidationErrors::new();

        let key = string_field(&mut errors, "key", input.key.as_ref(), creating);
        if let Some(key) = &key {
            if key.chars().count() > MAX_KEY_LEN {
                errors.add(
                    "key",
                    format!("The key field must not be greater than {} characters.", MAX_KEY_LEN),
                );
            }
        }
        let default_value = string_field(
            &mut errors,
            "default_value",
            input.default_value.as_ref(),
            creating,
        );
        let texts = input
            .translations
            .as_ref()
            .and_then(|value| texts_field(&mut errors, value));
        let tags = match input.tags.as_ref().and_then(|value| tags_field(&mut errors, value)) {
            Some(tags) => Some(self.existing_tags_only(&mut errors, tags).await?),
            None => None,
        };

        errors.into_result()?;
        Ok(Validated {
            key,
            default_value,
            texts,
            tags,
        })
    }

    async fn existing_tags_only(
        &self,
        errors: &mut ValidationErrors,
        tags: Vec<String>,
    ) -> Result<Vec<String>, CatalogError> {
        let known: BTreeSet<String> = self.store.list_tags().await?.into_iter().collect();
        for (i, tag) in tags.iter().enumerate() {
            if !known.contains(tag) {
                errors.add(format!("tags.{}", i), format!("The selected tags.{} is invalid.", i));
            }
        }
        Ok(tags)
    }

    /// Drop texts for locale codes that do not exist, with a warning.
    async fn known_locales_only(
        &self,
        texts: BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, CatalogError> {
        let known: BTreeSet<String> = self
            .store
            .list_locales()
            .await?
            .into_iter()
            .map(|locale| locale.code)
            .collect();

        Ok(texts
            .into_iter()
            .filter(|(code, _)| {
                let exists = known.contains(code);
                if !exists {
                    warn!(locale = %code, "Skipping translation text for unknown locale");
                }
                exists
            })
            .collect())
    }
}

/// A string field. Missing or blank values are an error only when required;
/// a present but blank value is always an error.
fn string_field(
    errors: &mut ValidationErrors,
    field: &str,
    value: Option<&Value>,
    required: bool,
) -> Option<String> {
    match value {
        None if required => {
            errors.add(field, format!("The {} field is required.", field));
            None
        }
        None => None,
        Some(Value::String(s)) if s.trim().is_empty() => {
            errors.add(field, format!("The {} field is required.", field));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.add(field, format!("The {} field must be a string.", field));
            None
        }
    }
}

fn texts_field(errors: &mut ValidationErrors, value: &Value) -> Option<BTreeMap<String, String>> {
    let Value::Object(entries) = value else {
        errors.add("translations", "The translations field must be an object.");
        return None;
    };

    let mut texts = BTreeMap::new();
    for (code, text) in entries {
        match text {
            Value::String(text) => {
                texts.insert(code.clone(), text.clone());
            }
            _ => errors.add(
                format!("translations.{}", code),
                format!("The translations.{} field must be a string.", code),
            ),
        }
    }
    Some(texts)
}

fn tags_field(errors: &mut ValidationErrors, value: &Value) -> Option<Vec<String>> {
    let Value::Array(items) = value else {
        errors.add("tags", "The tags field must be an array.");
        return None;
    };

    let mut tags = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item {
            Value::String(tag) => tags.push(tag.clone()),
            _ => errors.add(
                format!("tags.{}", i),
                format!("The tags.{} field must be a string.", i),
            ),
        }
    }
    Some(tags)
}
