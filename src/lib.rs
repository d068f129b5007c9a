//! Translation catalog service with a per-locale export cache.
//!
//! Reads go through [`export::ExportService`], which serves each locale's
//! key → text map from the [`cache::ExportCache`] and rebuilds it from the
//! catalog store on a miss. Writes go through [`catalog::CatalogService`],
//! which invalidates the affected locales before returning.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod export;
pub mod invalidation;
pub mod locales;
pub mod metrics;
pub mod retry;
pub mod security;
pub mod server;
pub mod store;
