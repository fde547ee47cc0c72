//! Parley Storage - Key-Value Capability, Cache and Store Traits
//!
//! Defines the key-value abstraction shared by presence and caching, the
//! read-through cache over it, and the relational store collaborator used by
//! the service layer. The Postgres store lives in parley-service.

pub mod cache;
pub mod kv;
pub mod store;

pub use cache::{
    CacheConfig, CacheKey, CacheKind, CacheRead, CacheStats, ReadSource, ReadThroughCache,
};
pub use kv::{InMemoryKvStore, KeyValueStore, KvCommand, Pipeline, PipelineReply, RedisKvStore};
pub use store::{ChatStore, DirectChatStore, InMemoryChatStore, NewChat, DM_KEY_CONSTRAINT};
