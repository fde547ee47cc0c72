//! Shared service state.

use std::sync::Arc;
use std::time::Instant;

use parley_core::{ParleyConfig, ParleyResult};
use parley_presence::PresenceTracker;
use parley_storage::{CacheConfig, ChatStore, KeyValueStore, ReadThroughCache, RedisKvStore};
use serde::Serialize;
use tracing::{info, warn};

use crate::chat_service::ChatService;
use crate::config::ServiceConfig;
use crate::db::PgChatStore;

/// State backed by Redis and PostgreSQL.
pub type ProductionState = ServiceState<RedisKvStore, PgChatStore>;

/// Result of probing both backing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub kv: bool,
    pub database: bool,
}

impl Readiness {
    /// The database is required; a down key-value store only degrades
    /// caching and presence.
    pub fn is_ready(&self) -> bool {
        self.database
    }

    pub fn is_degraded(&self) -> bool {
        self.database && !self.kv
    }
}

/// Everything a request handler needs, cheap to clone.
pub struct ServiceState<K: KeyValueStore, S: ChatStore> {
    pub kv: Arc<K>,
    pub store: Arc<S>,
    pub presence: PresenceTracker<K>,
    pub chats: ChatService<K, S>,
    pub start_time: Instant,
}

impl<K: KeyValueStore, S: ChatStore> Clone for ServiceState<K, S> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            store: Arc::clone(&self.store),
            presence: self.presence.clone(),
            chats: self.chats.clone(),
            start_time: self.start_time,
        }
    }
}

impl<K: KeyValueStore, S: ChatStore> ServiceState<K, S> {
    pub fn new(kv: Arc<K>, store: Arc<S>, config: &ParleyConfig, cache: CacheConfig) -> Self {
        let cache = ReadThroughCache::new(Arc::clone(&kv), cache);
        Self {
            presence: PresenceTracker::from_config(Arc::clone(&kv), config),
            chats: ChatService::new(Arc::clone(&store), cache, config),
            kv,
            store,
            start_time: Instant::now(),
        }
    }

    /// Probe both stores.
    pub async fn readiness(&self) -> Readiness {
        let kv = match self.kv.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Key-value store not ready");
                false
            }
        };
        let database = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Database not ready");
                false
            }
        };
        Readiness { kv, database }
    }
}

impl ProductionState {
    /// Connect to Redis and PostgreSQL and apply the schema.
    pub async fn connect(config: &ServiceConfig) -> ParleyResult<Self> {
        config.validate()?;
        let kv = Arc::new(RedisKvStore::connect(&config.kv.url).await?);
        let store = Arc::new(PgChatStore::from_config(&config.db)?);
        store.migrate().await?;
        let pg = config.db.connection()?;
        info!(
            db_name = pg.get_dbname().unwrap_or("-"),
            pool_size = config.db.pool_size,
            "Service state connected"
        );
        Ok(Self::new(kv, store, &config.parley, config.cache_config()))
    }
}
