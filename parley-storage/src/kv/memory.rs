//! In-process key-value store with TTL semantics.
//!
//! Expiry is evaluated against [`tokio::time::Instant`], so tests running on
//! a paused tokio clock can advance time to expire keys. Expired keys are
//! removed when a read or write touches them, and a full sweep runs every
//! [`SWEEP_EVERY`] write batches so untouched keys do not accumulate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use parley_core::{KvError, ParleyResult};
use tokio::time::Instant;

use super::{KeyValueStore, KvCommand, Pipeline, PipelineReply};

/// Write batches between full sweeps of expired keys.
pub const SWEEP_EVERY: u64 = 128;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Key-value store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
    round_trips: AtomicU64,
    writes: AtomicU64,
}

fn poisoned() -> KvError {
    KvError::Unavailable {
        reason: "in-memory store lock poisoned".to_string(),
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls served so far; a pipeline counts as one.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Remaining lifetime of a live key, `None` for absent or persistent keys.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> ParleyResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(Self::sweep(&mut entries, now))
    }

    fn sweep(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Remove keys a read found expired; re-checked under the write lock
    /// since a writer may have replaced them in between.
    fn evict_expired(&self, keys: &[&str], now: Instant) -> ParleyResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        for key in keys {
            if entries.get(*key).is_some_and(|e| !e.is_live(now)) {
                entries.remove(*key);
            }
        }
        Ok(())
    }

    fn tick(&self) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
    }

    fn apply(entries: &mut HashMap<String, Entry>, command: &KvCommand, now: Instant) -> PipelineReply {
        // Drop an expired entry before the command observes it.
        let key = match command {
            KvCommand::Get { key }
            | KvCommand::Exists { key }
            | KvCommand::Set { key, .. }
            | KvCommand::Del { key }
            | KvCommand::Expire { key, .. } => key,
        };
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }

        match command {
            KvCommand::Get { key } => PipelineReply::Value(entries.get(key).map(|e| e.value.clone())),
            KvCommand::Exists { key } => PipelineReply::Flag(entries.contains_key(key)),
            KvCommand::Set { key, value, ttl } => {
                entries.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
                PipelineReply::Ok
            }
            KvCommand::Del { key } => PipelineReply::Flag(entries.remove(key).is_some()),
            KvCommand::Expire { key, ttl } => match entries.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(now + *ttl);
                    PipelineReply::Flag(true)
                }
                None => PipelineReply::Flag(false),
            },
        }
    }

    fn run(&self, commands: &[KvCommand]) -> ParleyResult<Vec<PipelineReply>> {
        self.tick();
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            Self::sweep(&mut entries, now);
        }
        Ok(commands
            .iter()
            .map(|command| Self::apply(&mut entries, command, now))
            .collect())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> ParleyResult<Option<String>> {
        self.tick();
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.evict_expired(&[key], now)?;
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ParleyResult<()> {
        self.run(&[KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        }])?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> ParleyResult<u64> {
        let commands: Vec<_> = keys
            .iter()
            .map(|key| KvCommand::Del { key: key.clone() })
            .collect();
        let replies = self.run(&commands)?;
        Ok(replies.iter().filter(|r| r.as_flag()).count() as u64)
    }

    async fn mget(&self, keys: &[String]) -> ParleyResult<Vec<Option<String>>> {
        self.tick();
        let now = Instant::now();
        let mut expired = Vec::new();
        let values = {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            keys.iter()
                .map(|key| match entries.get(key) {
                    Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
                    Some(_) => {
                        expired.push(key.as_str());
                        None
                    }
                    None => None,
                })
                .collect()
        };
        self.evict_expired(&expired, now)?;
        Ok(values)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ParleyResult<bool> {
        let replies = self.run(&[KvCommand::Expire {
            key: key.to_string(),
            ttl,
        }])?;
        Ok(replies.first().is_some_and(PipelineReply::as_flag))
    }

    async fn exec(&self, pipeline: Pipeline) -> ParleyResult<Vec<PipelineReply>> {
        // Commands run under one write lock, so every pipeline is atomic here.
        self.run(pipeline.commands())
    }

    async fn ping(&self) -> ParleyResult<()> {
        self.entries.read().map(|_| ()).map_err(|_| poisoned().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        let store = InMemoryKvStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        let removed = store
            .del(&["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    fn stored(store: &InMemoryKvStore) -> usize {
        store.entries.read().unwrap().len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_remove_expired_keys() {
        let store = InMemoryKvStore::new();
        let keys: Vec<String> = (0..1000).map(|i| format!("presence:online:{i}")).collect();
        for key in &keys {
            store
                .set(key, "1", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 1000);

        tokio::time::advance(Duration::from_secs(5)).await;
        for key in &keys[..500] {
            assert!(store.get(key).await.unwrap().is_none());
        }
        assert!(store.mget(&keys[500..]).await.unwrap().iter().all(Option::is_none));

        assert_eq!(store.len(), 0);
        assert_eq!(stored(&store), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_untouched_expired_keys() {
        let store = InMemoryKvStore::new();
        for i in 0..10 {
            store
                .set(&format!("stale:{i}"), "v", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        for i in 0..SWEEP_EVERY {
            store.set(&format!("fresh:{i}"), "v", None).await.unwrap();
        }
        assert_eq!(stored(&store), SWEEP_EVERY as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_live_and_persistent_keys() {
        let store = InMemoryKvStore::new();
        store.set("short", "v", Some(Duration::from_secs(1))).await.unwrap();
        store.set("long", "v", Some(Duration::from_secs(60))).await.unwrap();
        store.set("forever", "v", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(stored(&store), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_refreshes_only_live_keys() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.expire("k", Duration::from_secs(10)).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_without_ttl_clears_previous_ttl() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(store.ttl("k").is_some());
        store.set("k", "w", None).await.unwrap();
        assert!(store.ttl("k").is_none());
    }

    #[tokio::test]
    async fn test_mget_preserves_order() {
        let store = InMemoryKvStore::new();
        store.set("a", "1", None).await.unwrap();
        store.set("c", "3", None).await.unwrap();
        let values = store
            .mget(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("3".to_string())]);
    }

    #[tokio::test]
    async fn test_pipeline_is_one_round_trip() {
        let store = InMemoryKvStore::new();
        let before = store.round_trips();
        let replies = store
            .exec(
                Pipeline::new()
                    .set("a", "1", None)
                    .exists("a")
                    .get("a")
                    .del("a")
                    .exists("a"),
            )
            .await
            .unwrap();

        assert_eq!(store.round_trips() - before, 1);
        assert_eq!(
            replies,
            vec![
                PipelineReply::Ok,
                PipelineReply::Flag(true),
                PipelineReply::Value(Some("1".to_string())),
                PipelineReply::Flag(true),
                PipelineReply::Flag(false),
            ]
        );
    }
}
