//! Cache-aside reads in front of the relational store.
//!
//! A read looks up the entry, shape-checks and decodes it, and on any miss
//! calls the loader and stores its result. The key-value store is never on the
//! failure path: when it is unreachable the cache becomes a pass-through.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parley_core::{CacheTtls, ParleyResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::validator;
use crate::kv::KeyValueStore;

/// Configuration for the read-through cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Prefix of every key written by this cache.
    pub namespace: String,
    pub ttls: CacheTtls,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "parley".to_string(),
            ttls: CacheTtls::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ttls(mut self, ttls: CacheTtls) -> Self {
        self.ttls = ttls;
        self
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries present but discarded for failing the shape check or decoding.
    pub rejected: u64,
    /// Operations where the key-value store failed and was bypassed.
    pub degraded: u64,
    pub stores: u64,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`; rejected entries count as misses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
    degraded: AtomicU64,
    stores: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }
}

/// Where a value returned by [`ReadThroughCache::read_traced`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    /// Loaded after a miss and written back.
    Loader,
    /// Loaded while the key-value store was unreachable.
    Degraded,
}

/// A value together with its [`ReadSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    source: ReadSource,
}

impl<T> CacheRead<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    pub fn was_cache_hit(&self) -> bool {
        self.source == ReadSource::Cache
    }
}

enum Lookup<T> {
    Hit(T),
    Miss,
    Unavailable,
}

/// Cache-aside wrapper over a [`KeyValueStore`].
pub struct ReadThroughCache<K: KeyValueStore> {
    kv: Arc<K>,
    config: CacheConfig,
    counters: Arc<Counters>,
}

impl<K: KeyValueStore> Clone for ReadThroughCache<K> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<K: KeyValueStore> ReadThroughCache<K> {
    pub fn new(kv: Arc<K>, config: CacheConfig) -> Self {
        Self {
            kv,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_defaults(kv: Arc<K>) -> Self {
        Self::new(kv, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &K {
        &self.kv
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Read `key`, calling `loader` on a miss.
    ///
    /// Only cached payloads are shape-checked; a cached entry that fails the
    /// check is never returned. A loader value comes from the source of truth
    /// and is returned even when its serialized form fails the check for
    /// `key`'s kind, but it is not written to the cache, so every later read
    /// goes back to the loader. Loader errors are returned as-is and never
    /// cached. Key-value store errors are logged and absorbed.
    pub async fn read<T, F, Fut>(&self, key: &CacheKey, loader: F) -> ParleyResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ParleyResult<T>>,
    {
        self.read_traced(key, loader).await.map(CacheRead::into_value)
    }

    /// [`read`](Self::read), also reporting where the value came from.
    pub async fn read_traced<T, F, Fut>(&self, key: &CacheKey, loader: F) -> ParleyResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ParleyResult<T>>,
    {
        let store_key = key.render(&self.config.namespace);

        match self.lookup::<T>(key, &store_key).await {
            Lookup::Hit(value) => {
                return Ok(CacheRead {
                    value,
                    source: ReadSource::Cache,
                })
            }
            Lookup::Unavailable => {
                let value = loader().await?;
                return Ok(CacheRead {
                    value,
                    source: ReadSource::Degraded,
                });
            }
            Lookup::Miss => {}
        }

        let value = loader().await?;
        self.store(key, &store_key, &value).await;
        Ok(CacheRead {
            value,
            source: ReadSource::Loader,
        })
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey, store_key: &str) -> Lookup<T> {
        let raw = match self.kv.get(store_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                Counters::bump(&self.counters.misses);
                return Lookup::Miss;
            }
            Err(e) => {
                Counters::bump(&self.counters.degraded);
                warn!(error = %e, key = %store_key, "Cache read failed, loading from source");
                return Lookup::Unavailable;
            }
        };

        let payload: Value = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(e) => {
                Counters::bump(&self.counters.rejected);
                warn!(error = %e, key = %store_key, "Cached payload is not JSON, treating as miss");
                return Lookup::Miss;
            }
        };

        if !validator::is_valid(key.kind(), &payload) {
            Counters::bump(&self.counters.rejected);
            warn!(key = %store_key, kind = %key.kind(), "Cached payload failed shape check, treating as miss");
            return Lookup::Miss;
        }

        match serde_json::from_value(payload) {
            Ok(value) => {
                Counters::bump(&self.counters.hits);
                Lookup::Hit(value)
            }
            Err(e) => {
                Counters::bump(&self.counters.rejected);
                warn!(error = %e, key = %store_key, "Cached payload failed to decode, treating as miss");
                Lookup::Miss
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &CacheKey, store_key: &str, value: &T) {
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, key = %store_key, "Could not serialize value for cache");
                return;
            }
        };
        // Never write what the next read would reject.
        if !validator::is_valid(key.kind(), &payload) {
            debug!(key = %store_key, kind = %key.kind(), "Skipping cache write of off-shape value");
            return;
        }

        let ttl = key.kind().ttl(&self.config.ttls);
        match self.kv.set(store_key, &payload.to_string(), Some(ttl)).await {
            Ok(()) => Counters::bump(&self.counters.stores),
            Err(e) => {
                Counters::bump(&self.counters.degraded);
                warn!(error = %e, key = %store_key, "Cache write failed");
            }
        }
    }

    /// Evict one entry.
    pub async fn invalidate(&self, key: &CacheKey) -> u64 {
        self.invalidate_many([*key]).await
    }

    /// Evict a set of entries in one round trip, returning how many existed.
    ///
    /// A key-value store failure is logged and reported as zero evictions;
    /// the entries then age out with their TTL.
    pub async fn invalidate_many(&self, keys: impl IntoIterator<Item = CacheKey>) -> u64 {
        let store_keys: Vec<String> = keys
            .into_iter()
            .map(|key| key.render(&self.config.namespace))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if store_keys.is_empty() {
            return 0;
        }

        match self.kv.del(&store_keys).await {
            Ok(removed) => {
                debug!(keys = store_keys.len(), removed, "Invalidated cache entries");
                removed
            }
            Err(e) => {
                Counters::bump(&self.counters.degraded);
                warn!(error = %e, keys = ?store_keys, "Cache invalidation failed");
                0
            }
        }
    }
}
