//! Error types for Parley operations

use crate::{ChatId, EntityKind, UserId};
use thiserror::Error;

/// Relational store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("Cursor {cursor} does not point at an item in this feed")]
    InvalidCursor { cursor: String },

    #[error("Database error: {reason}")]
    Database { reason: String },

    #[error("Connection pool error: {reason}")]
    Pool { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Key-value store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("Key-value store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Key-value command failed: {reason}")]
    Command { reason: String },

    #[error("Could not decode value at {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("A direct chat needs two distinct users, got {user_id} twice")]
    SelfConversation { user_id: UserId },

    #[error("Chat {chat_id} has {participants} participants, a direct chat needs exactly 2")]
    NotDirectChat { chat_id: ChatId, participants: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Parley errors.
#[derive(Debug, Clone, Error)]
pub enum ParleyError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("User {user_id} is not a member of chat {chat_id}")]
    Forbidden { user_id: UserId, chat_id: ChatId },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Key-value error: {0}")]
    Kv(#[from] KvError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ParleyError {
    /// Shorthand for a not-found error.
    pub fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for failures of shared infrastructure (key-value store, connection
    /// pool) rather than of the request itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Kv(_) | Self::Storage(StorageError::Pool { .. }))
    }

    /// True when the store rejected a write on a uniqueness constraint.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Storage(StorageError::UniqueViolation { .. }))
    }
}

/// Result type alias for Parley operations.
pub type ParleyResult<T> = Result<T, ParleyError>;
