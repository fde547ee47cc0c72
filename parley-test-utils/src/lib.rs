//! Parley Test Utilities
//!
//! Shared test infrastructure for the Parley workspace:
//! - Proptest generators for ids, messages and notifications
//! - Fixtures for common chat scenarios
//! - Failure-injecting key-value store
//! - Assertions over `ParleyResult`

// Re-export in-memory adapters from their source crate
pub use parley_storage::{InMemoryChatStore, InMemoryKvStore};

// Re-export core types for convenience
pub use parley_core::{
    ChatDetail, ChatId, ChatIdentity, DmKey, EntityIdType, EntityKind, Message, MessageId,
    Notification, NotificationId, ParleyConfig, ParleyError, ParleyResult, Participant,
    StorageError, Timestamp, UserId,
};

use async_trait::async_trait;
use chrono::Utc;
use parley_core::KvError;
use parley_storage::{KeyValueStore, Pipeline, PipelineReply};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// FAILURE INJECTION
// ============================================================================

/// Key-value store that fails every call as if the server were down.
#[derive(Debug, Default)]
pub struct UnreachableKvStore {
    calls: AtomicU64,
}

impl UnreachableKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls attempted against the store.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn fail<T>(&self) -> ParleyResult<T> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(KvError::Unavailable {
            reason: "connection refused".to_string(),
        }
        .into())
    }
}

#[async_trait]
impl KeyValueStore for UnreachableKvStore {
    async fn get(&self, _key: &str) -> ParleyResult<Option<String>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> ParleyResult<()> {
        self.fail()
    }

    async fn del(&self, _keys: &[String]) -> ParleyResult<u64> {
        self.fail()
    }

    async fn mget(&self, _keys: &[String]) -> ParleyResult<Vec<Option<String>>> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> ParleyResult<bool> {
        self.fail()
    }

    async fn exec(&self, _pipeline: Pipeline) -> ParleyResult<Vec<PipelineReply>> {
        self.fail()
    }

    async fn ping(&self) -> ParleyResult<()> {
        self.fail()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Parley entity types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        arb_uuid().prop_map(UserId::new)
    }

    pub fn arb_chat_id() -> impl Strategy<Value = ChatId> {
        arb_uuid().prop_map(ChatId::new)
    }

    /// Two distinct users.
    pub fn arb_user_pair() -> impl Strategy<Value = (UserId, UserId)> {
        (arb_user_id(), arb_user_id()).prop_filter("users must differ", |(a, b)| a != b)
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_message(chat_id: ChatId, sender_id: UserId) -> impl Strategy<Value = Message> {
        (arb_uuid(), "[a-z ]{1,40}", any::<bool>(), arb_timestamp()).prop_map(
            move |(id, body, pinned, created_at)| Message {
                message_id: MessageId::new(id),
                chat_id,
                sender_id,
                body,
                pinned,
                created_at,
            },
        )
    }

    pub fn arb_notification(user_id: UserId) -> impl Strategy<Value = Notification> {
        (arb_uuid(), prop_oneof![Just("mention"), Just("invite"), Just("reaction")], arb_timestamp())
            .prop_map(move |(id, kind, created_at)| Notification {
                notification_id: NotificationId::new(id),
                user_id,
                kind: kind.to_string(),
                payload: serde_json::json!({}),
                read: false,
                created_at,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common chat scenarios.

    use super::*;

    /// Default configuration with small page sizes so paging is easy to hit.
    pub fn small_page_config() -> ParleyConfig {
        ParleyConfig {
            message_limits: parley_core::PageLimits::new(20, 100),
            notification_limits: parley_core::PageLimits::new(20, 50),
            ..ParleyConfig::default()
        }
    }

    pub fn participant(user_id: UserId, joined_at: Timestamp) -> Participant {
        Participant {
            user_id,
            display_name: user_id.to_string(),
            joined_at,
        }
    }

    /// A non-group chat row as written before canonical keys existed.
    pub fn legacy_direct_chat(members: &[UserId]) -> ChatDetail {
        let now = Utc::now();
        ChatDetail {
            chat_id: ChatId::now_v7(),
            is_group: false,
            title: None,
            dm_key: None,
            participants: members.iter().map(|id| participant(*id, now)).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `count` messages one second apart, oldest first.
    pub fn message_series(chat_id: ChatId, sender_id: UserId, count: usize) -> Vec<Message> {
        let base = Utc::now() - chrono::Duration::hours(1);
        (0..count)
            .map(|i| Message {
                message_id: MessageId::now_v7(),
                chat_id,
                sender_id,
                body: format!("message {i}"),
                pinned: false,
                created_at: base + chrono::Duration::seconds(i as i64),
            })
            .collect()
    }

    pub fn notification(user_id: UserId, kind: &str) -> Notification {
        Notification {
            notification_id: NotificationId::now_v7(),
            user_id,
            kind: kind.to_string(),
            payload: serde_json::json!({ "source": "test" }),
            read: false,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over Parley error variants.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &ParleyResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_forbidden<T: std::fmt::Debug>(result: &ParleyResult<T>) {
        match result {
            Err(ParleyError::Forbidden { .. }) => {}
            other => panic!("Expected Forbidden, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &ParleyResult<T>, entity: EntityKind) {
        match result {
            Err(ParleyError::NotFound { entity: e, .. }) => {
                assert_eq!(*e, entity, "Wrong entity kind in NotFound error");
            }
            other => panic!("Expected NotFound for {}, got: {:?}", entity, other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_cursor<T: std::fmt::Debug>(result: &ParleyResult<T>) {
        match result {
            Err(ParleyError::Storage(StorageError::InvalidCursor { .. })) => {}
            other => panic!("Expected InvalidCursor, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &ParleyResult<T>) {
        match result {
            Err(ParleyError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }
}
