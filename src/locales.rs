//! Default locale registry and locale code validation.
//!
//! The catalog store is the source of truth for which locales exist. This
//! registry only lists the locales and tags a fresh catalog is seeded with,
//! and decides whether a string is shaped like a locale code at all.

use regex::Regex;
use std::sync::OnceLock;

/// A locale a fresh catalog starts with.
#[derive(Debug, Clone)]
pub struct LocaleConfig {
    /// ISO 639-1 language code (e.g., "en", "es", "fr")
    pub code: &'static str,

    /// English display name (e.g., "English", "Spanish")
    pub name: &'static str,
}

/// Registry of default locales and tags.
pub struct LocaleRegistry {
    locales: Vec<LocaleConfig>,
    tags: Vec<&'static str>,
}

static REGISTRY: OnceLock<LocaleRegistry> = OnceLock::new();

static LOCALE_CODE_REGEX: OnceLock<Regex> = OnceLock::new();

/// Longest code the `languages.code` column accepts.
pub const MAX_LOCALE_CODE_LEN: usize = 10;

impl LocaleRegistry {
    /// Get the registry instance, initializing it on first call.
    pub fn get() -> &'static LocaleRegistry {
        REGISTRY.get_or_init(|| LocaleRegistry {
            locales: default_locales(),
            tags: vec!["web", "mobile", "desktop"],
        })
    }

    /// All default locales, in seeding order.
    pub fn locales(&self) -> &[LocaleConfig] {
        &self.locales
    }

    /// All default tag names.
    pub fn tags(&self) -> &[&'static str] {
        &self.tags
    }
}

/// Check whether `code` looks like a locale code ("en", "pt-BR", "zh_Hant").
///
/// Codes failing this check cannot exist in the catalog, so the export path
/// answers them with 404 without consulting the cache or the store.
pub fn is_locale_code(code: &str) -> bool {
    if code.is_empty() || code.len() > MAX_LOCALE_CODE_LEN {
        return false;
    }
    let regex = LOCALE_CODE_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z]{2,3}([-_][A-Za-z0-9]{2,8})*$").expect("locale code regex is valid")
    });
    regex.is_match(code)
}

fn default_locales() -> Vec<LocaleConfig> {
    vec![
        LocaleConfig {
            code: "en",
            name: "English",
        },
        LocaleConfig {
            code: "fr",
            name: "French",
        },
        LocaleConfig {
            code: "es",
            name: "Spanish",
        },
        LocaleConfig {
            code: "de",
            name: "German",
        },
        LocaleConfig {
            code: "it",
            name: "Italian",
        },
        LocaleConfig {
            code: "pt",
            name: "Portuguese",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_get_returns_singleton() {
        assert!(std::ptr::eq(LocaleRegistry::get(), LocaleRegistry::get()));
    }

    #[test]
    fn test_default_locales() {
        let registry = LocaleRegistry::get();
        let codes: Vec<_> = registry.locales().iter().map(|l| l.code).collect();
        assert_eq!(codes, vec!["en", "fr", "es", "de", "it", "pt"]);
        assert!(registry
            .locales()
            .iter()
            .any(|l| l.code == "es" && l.name == "Spanish"));
    }

    #[test]
    fn test_default_tags() {
        assert_eq!(LocaleRegistry::get().tags(), &["web", "mobile", "desktop"]);
    }

    #[test]
    fn test_is_locale_code_accepts_language_tags() {
        for code in ["en", "es", "pt-BR", "zh_Hant", "fil", "xx"] {
            assert!(is_locale_code(code), "{} should be accepted", code);
        }
    }

    #[test]
    fn test_is_locale_code_rejects_garbage() {
        for code in ["", "e", "english-long-code", "en/../x", "e1", "en-", "../etc", "en us"] {
            assert!(!is_locale_code(code), "{:?} should be rejected", code);
        }
    }
}
