//! Service Configuration
//!
//! Combines the core [`ParleyConfig`] with the connection settings of the
//! two backing stores.

use crate::db::DbConfig;
use parley_core::{ConfigError, ParleyConfig, ParleyResult};
use parley_storage::CacheConfig;

/// Key-value store connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvConfig {
    /// Redis connection URL
    pub url: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl KvConfig {
    /// Load from `PARLEY_REDIS_URL`, falling back to a local server.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("PARLEY_REDIS_URL").unwrap_or_else(|_| Self::default().url),
        }
    }
}

/// Everything a running service needs.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub parley: ParleyConfig,
    pub db: DbConfig,
    pub kv: KvConfig,
    /// Prefix for every cache key (`PARLEY_CACHE_NAMESPACE`, default `parley`).
    pub cache_namespace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            parley: ParleyConfig::default(),
            db: DbConfig::default(),
            kv: KvConfig::default(),
            cache_namespace: CacheConfig::default().namespace,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            parley: ParleyConfig::from_env(),
            db: DbConfig::from_env(),
            kv: KvConfig::from_env(),
            cache_namespace: std::env::var("PARLEY_CACHE_NAMESPACE")
                .unwrap_or_else(|_| CacheConfig::default().namespace),
        }
    }

    pub fn validate(&self) -> ParleyResult<()> {
        self.parley.validate()?;
        if self.kv.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "PARLEY_REDIS_URL".to_string(),
            }
            .into());
        }
        self.db.validate()?;
        Ok(())
    }

    /// Cache settings derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .with_namespace(self.cache_namespace.clone())
            .with_ttls(self.parley.cache.clone())
    }
}
