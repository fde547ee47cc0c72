//! Key-value store capability.
//!
//! The presence tracker and the read-through cache only ever talk to a
//! [`KeyValueStore`]. Two adapters ship with the crate: [`InMemoryKvStore`]
//! for tests and single-process deployments, and [`RedisKvStore`] for
//! production.

pub mod memory;
pub mod redis_store;

pub use self::memory::InMemoryKvStore;
pub use self::redis_store::RedisKvStore;

use async_trait::async_trait;
use parley_core::ParleyResult;
use std::time::Duration;

/// A single command queued on a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    Get { key: String },
    Exists { key: String },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del { key: String },
    Expire { key: String, ttl: Duration },
}

/// Reply to one pipelined command, in the order the commands were queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineReply {
    /// Reply to `Get`.
    Value(Option<String>),
    /// Reply to `Exists`, `Del` and `Expire`: whether the key was present.
    Flag(bool),
    /// Reply to `Set`.
    Ok,
}

impl PipelineReply {
    pub fn into_value(self) -> Option<String> {
        match self {
            Self::Value(value) => value,
            _ => None,
        }
    }

    pub fn as_flag(&self) -> bool {
        matches!(self, Self::Flag(true))
    }
}

/// A batch of commands sent to the store in one round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<KvCommand>,
    atomic: bool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the backend to apply the batch as one transaction where it can.
    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn get(mut self, key: impl Into<String>) -> Self {
        self.commands.push(KvCommand::Get { key: key.into() });
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.commands.push(KvCommand::Exists { key: key.into() });
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.commands.push(KvCommand::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.commands.push(KvCommand::Del { key: key.into() });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.commands.push(KvCommand::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn commands(&self) -> &[KvCommand] {
        &self.commands
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Shared string key-value store with optional per-key TTL.
///
/// Implementations must be safe to share across tasks. Every method is an
/// I/O boundary and may fail with [`parley_core::KvError`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> ParleyResult<Option<String>>;

    /// Store `value`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ParleyResult<()>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> ParleyResult<u64>;

    /// Fetch many keys at once; missing keys come back as `None`.
    async fn mget(&self, keys: &[String]) -> ParleyResult<Vec<Option<String>>>;

    /// Reset the remaining lifetime of an existing key. Returns `false` and
    /// does nothing when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> ParleyResult<bool>;

    /// Run a batch of commands in a single round trip.
    async fn exec(&self, pipeline: Pipeline) -> ParleyResult<Vec<PipelineReply>>;

    /// Liveness probe.
    async fn ping(&self) -> ParleyResult<()>;
}
