use anyhow::{bail, Context, Result};
use locale_export::config::Config;
use locale_export::locales::LocaleRegistry;
use locale_export::store::{CatalogStore, NewTranslation, PgCatalog};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const BATCH_SIZE: usize = 1000;

/// Fixed seed so repeated runs produce the same catalog.
const SEED: u64 = 42;

fn synthetic(index: usize, locales: &[&str], tags: &[&str], rng: &mut StdRng) -> NewTranslation {
    let key = format!("synthetic.key_{:06}", index);
    let texts: BTreeMap<String, String> = locales
        .iter()
        .filter(|_| rng.gen_bool(0.5))
        .map(|code| (code.to_string(), format!("[{}] text {}", code, index)))
        .collect();
    let tags = if rng.gen_bool(1.0 / 3.0) {
        tags.choose(rng).map(|tag| vec![tag.to_string()]).unwrap_or_default()
    } else {
        vec![]
    };

    NewTranslation {
        key,
        default_value: format!("Default text {}", index),
        texts,
        tags,
    }
}

/// Seeding bypasses the service, so running servers never hear about it.
fn stale_cache_notice(ttl: Duration) -> String {
    format!(
        "Running servers keep serving cached exports for up to {}s; restart them to export the seeded catalog immediately",
        ttl.as_secs()
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("seed=info".parse()?),
        )
        .init();

    let count: usize = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("Invalid translation count: {}", arg))?,
        None => 0,
    };

    let config = Config::from_env()?;
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL must be set to seed the catalog");
    };

    let catalog = PgCatalog::connect(url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    catalog
        .migrate()
        .await
        .context("Failed to run database migrations")?;

    let registry = LocaleRegistry::get();
    for locale in registry.locales() {
        catalog.upsert_locale(locale.code, locale.name).await?;
    }
    for tag in registry.tags() {
        catalog.upsert_tag(tag).await?;
    }
    info!(
        "✓ Seeded {} locales and {} tags",
        registry.locales().len(),
        registry.tags().len()
    );

    if count > 0 {
        let codes: Vec<&str> = registry.locales().iter().map(|l| l.code).collect();
        let mut rng = StdRng::seed_from_u64(SEED);
        let started = Instant::now();
        let mut inserted = 0;

        for start in (0..count).step_by(BATCH_SIZE) {
            let end = (start + BATCH_SIZE).min(count);
            let batch: Vec<NewTranslation> = (start..end)
                .map(|i| synthetic(i, &codes, registry.tags(), &mut rng))
                .collect();
            inserted += catalog.bulk_insert(&batch).await?;
            info!("Inserted {}/{} translations", end, count);
        }

        info!(
            "✓ Seeded {} translations in {:.1}s ({} already existed)",
            inserted,
            started.elapsed().as_secs_f64(),
            count as u64 - inserted
        );
    }

    warn!("{}", stale_cache_notice(config.export_cache_ttl));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALES: [&str; 6] = ["en", "fr", "es", "de", "it", "pt"];
    const TAGS: [&str; 3] = ["web", "mobile", "desktop"];

    #[test]
    fn test_synthetic_data_is_reproducible() {
        let mut first = StdRng::seed_from_u64(SEED);
        let mut second = StdRng::seed_from_u64(SEED);

        for i in 0..50 {
            let a = synthetic(i, &LOCALES, &TAGS, &mut first);
            let b = synthetic(i, &LOCALES, &TAGS, &mut second);
            assert_eq!(a.key, b.key);
            assert_eq!(a.texts, b.texts);
            assert_eq!(a.tags, b.tags);
        }
    }

    #[test]
    fn test_synthetic_data_uses_known_locales_and_tags() {
        let mut rng = StdRng::seed_from_u64(SEED);
        let batch: Vec<NewTranslation> = (0..1000)
            .map(|i| synthetic(i, &LOCALES, &TAGS, &mut rng))
            .collect();

        assert!(batch
            .iter()
            .flat_map(|t| t.texts.keys())
            .all(|code| LOCALES.contains(&code.as_str())));
        assert!(batch
            .iter()
            .flat_map(|t| t.tags.iter())
            .all(|tag| TAGS.contains(&tag.as_str())));

        // Roughly half the locales and a third of the tags
        let texts: usize = batch.iter().map(|t| t.texts.len()).sum();
        let tagged = batch.iter().filter(|t| !t.tags.is_empty()).count();
        assert!((2400..3600).contains(&texts), "texts = {}", texts);
        assert!((230..430).contains(&tagged), "tagged = {}", tagged);
    }

    #[test]
    fn test_stale_cache_notice_names_ttl() {
        let notice = stale_cache_notice(Duration::from_secs(3600));
        assert!(notice.contains("3600s"));
        assert!(notice.contains("restart"));
    }
}
