use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Database (None = in-memory catalog)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Web server
    pub port: u16,

    // CRUD authentication (None = CRUD disabled)
    pub api_key: Option<String>,

    // Export cache
    pub export_cache_ttl: Duration,
    pub export_build_timeout: Duration,

    // Rate limiting (requests per client per minute)
    pub crud_rate_limit_per_minute: u32,
    pub export_rate_limit_per_minute: u32,

    // Pagination
    pub page_size: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            // Database
            database_url: optional_var("DATABASE_URL"),
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,

            // Web server
            port: parse_var("PORT", 8080)?,

            // CRUD authentication
            api_key: optional_var("API_KEY"),

            // Export cache - TTL is a safety net, invalidation on write is primary
            export_cache_ttl: Duration::from_secs(parse_var("EXPORT_CACHE_TTL_SECS", 3600)?),
            export_build_timeout: Duration::from_millis(parse_var(
                "EXPORT_BUILD_TIMEOUT_MS",
                2000,
            )?),

            // Rate limiting
            crud_rate_limit_per_minute: parse_var("CRUD_RATE_LIMIT_PER_MINUTE", 60)?,
            export_rate_limit_per_minute: parse_var("EXPORT_RATE_LIMIT_PER_MINUTE", 30)?,

            // Pagination
            page_size: parse_var("PAGE_SIZE", 15)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            port: 8080,
            api_key: None,
            export_cache_ttl: Duration::from_secs(3600),
            export_build_timeout: Duration::from_millis(2000),
            crud_rate_limit_per_minute: 60,
            export_rate_limit_per_minute: 30,
            page_size: 15,
        }
    }
}

/// Read an environment variable, treating empty values as unset
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable, falling back to `default` when unset.
/// A value that is set but unparseable is an error rather than a silent default.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_var(name) {
        Some(value) => value
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, value)),
        None => Ok(default),
    }
}
