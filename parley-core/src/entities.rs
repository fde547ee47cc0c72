//! Core entity structures

use crate::pagination::{Cursor, Keyset, Page};
use crate::{ChatId, EntityIdType, MessageId, NotificationId, Timestamp, UserId, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Separator between the two user ids of a canonical DM key.
pub const DM_KEY_SEPARATOR: char = '_';

/// Canonical, order-independent identity of a two-party conversation.
///
/// The two user ids are rendered as strings, sorted lexicographically and
/// joined with [`DM_KEY_SEPARATOR`] (`smaller_larger`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DmKey(String);

impl DmKey {
    /// Build the key for an unordered pair of distinct users.
    pub fn for_pair(a: UserId, b: UserId) -> Result<Self, ValidationError> {
        if a == b {
            return Err(ValidationError::SelfConversation { user_id: a });
        }
        let (a, b) = (a.to_string(), b.to_string());
        let (smaller, larger) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{smaller}{DM_KEY_SEPARATOR}{larger}")))
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a chat as far as DM canonicalisation is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub chat_id: ChatId,
    pub is_group: bool,
    pub participant_ids: BTreeSet<UserId>,
    /// Always `None` for groups. For direct chats, the canonical key of the
    /// two participants (absent only on rows predating canonicalisation).
    pub dm_key: Option<DmKey>,
}

impl ChatIdentity {
    /// A new direct chat between two distinct users, keyed canonically.
    pub fn direct(chat_id: ChatId, a: UserId, b: UserId) -> Result<Self, ValidationError> {
        let dm_key = DmKey::for_pair(a, b)?;
        Ok(Self {
            chat_id,
            is_group: false,
            participant_ids: [a, b].into_iter().collect(),
            dm_key: Some(dm_key),
        })
    }

    /// A new group chat. Groups never carry a DM key.
    pub fn group(chat_id: ChatId, participants: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            chat_id,
            is_group: true,
            participant_ids: participants.into_iter().collect(),
            dm_key: None,
        }
    }

    /// Compute the canonical key this chat should carry.
    ///
    /// Fails for chats that do not have exactly two participants.
    pub fn expected_dm_key(&self) -> Result<DmKey, ValidationError> {
        let mut ids = self.participant_ids.iter().copied();
        match (ids.next(), ids.next(), ids.next()) {
            (Some(a), Some(b), None) => DmKey::for_pair(a, b),
            _ => Err(ValidationError::NotDirectChat {
                chat_id: self.chat_id,
                participants: self.participant_ids.len(),
            }),
        }
    }
}

/// A chat member as shown in chat detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub joined_at: Timestamp,
}

/// Last-message preview shown in the chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: Timestamp,
}

/// One row of a user's chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub is_group: bool,
    pub title: Option<String>,
    pub participant_ids: Vec<UserId>,
    pub last_message: Option<MessagePreview>,
    pub updated_at: Timestamp,
}

/// A single chat with its first-class relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDetail {
    pub chat_id: ChatId,
    pub is_group: bool,
    pub title: Option<String>,
    pub dm_key: Option<DmKey>,
    pub participants: Vec<Participant>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ChatDetail {
    pub fn has_member(&self, user_id: UserId) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn member_ids(&self) -> Vec<UserId> {
        self.participants.iter().map(|p| p.user_id).collect()
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub body: String,
    pub pinned: bool,
    pub created_at: Timestamp,
}

impl Message {
    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            message_id: self.message_id,
            sender_id: self.sender_id,
            body: self.body.clone(),
            created_at: self.created_at,
        }
    }
}

impl Keyset for Message {
    fn keyset(&self) -> (Timestamp, Uuid) {
        (self.created_at, self.message_id.as_uuid())
    }
}

/// An in-app notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: NotificationId,
    pub user_id: UserId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub read: bool,
    pub created_at: Timestamp,
}

impl Keyset for Notification {
    fn keyset(&self) -> (Timestamp, Uuid) {
        (self.created_at, self.notification_id.as_uuid())
    }
}

/// Paging metadata returned alongside a page of items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
    pub limit: u32,
}

/// A page of a chat's messages (also used for pinned messages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub meta: PageMeta,
    pub messages: Vec<Message>,
}

impl MessagePage {
    pub fn from_page(page: Page<Message>, limit: u32) -> Self {
        Self {
            meta: PageMeta {
                next_cursor: page.next_cursor,
                has_more: page.has_more,
                limit,
            },
            messages: page.items,
        }
    }
}

/// A page of a user's notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPage {
    pub meta: PageMeta,
    pub notifications: Vec<Notification>,
}

impl NotificationPage {
    pub fn from_page(page: Page<Notification>, limit: u32) -> Self {
        Self {
            meta: PageMeta {
                next_cursor: page.next_cursor,
                has_more: page.has_more,
                limit,
            },
            notifications: page.items,
        }
    }
}

/// Online/offline state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    Online,
    Offline,
}

/// Presence of a single user.
///
/// `last_seen_at` is only ever populated for offline users, and only when
/// they went offline explicitly. A user whose online marker silently expired
/// is offline with an unknown last-seen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub state: PresenceState,
    pub last_seen_at: Option<Timestamp>,
}

impl PresenceRecord {
    pub fn online(user_id: UserId) -> Self {
        Self {
            user_id,
            state: PresenceState::Online,
            last_seen_at: None,
        }
    }

    pub fn offline(user_id: UserId, last_seen_at: Option<Timestamp>) -> Self {
        Self {
            user_id,
            state: PresenceState::Offline,
            last_seen_at,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == PresenceState::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn user(n: u128) -> UserId {
        UserId::new(Uuid::from_u128(n))
    }

    #[test]
    fn test_dm_key_sorts_and_joins() {
        let a = user(2);
        let b = user(1);
        let key = DmKey::for_pair(a, b).unwrap();
        assert_eq!(key.as_str(), format!("{}_{}", b, a));
    }

    #[test]
    fn test_dm_key_rejects_self_conversation() {
        let a = user(7);
        assert!(matches!(
            DmKey::for_pair(a, a),
            Err(ValidationError::SelfConversation { user_id }) if user_id == a
        ));
    }

    #[test]
    fn test_direct_identity_carries_key() {
        let chat = ChatIdentity::direct(ChatId::now_v7(), user(1), user(2)).unwrap();
        assert!(!chat.is_group);
        assert_eq!(chat.participant_ids.len(), 2);
        assert_eq!(chat.dm_key, Some(DmKey::for_pair(user(2), user(1)).unwrap()));
    }

    #[test]
    fn test_group_identity_has_no_key() {
        let chat = ChatIdentity::group(ChatId::now_v7(), [user(1), user(2)]);
        assert!(chat.is_group);
        assert!(chat.dm_key.is_none());
    }

    #[test]
    fn test_expected_dm_key_requires_two_participants() {
        let mut chat = ChatIdentity::group(ChatId::now_v7(), [user(1), user(2), user(3)]);
        chat.is_group = false;
        assert!(matches!(
            chat.expected_dm_key(),
            Err(ValidationError::NotDirectChat { participants: 3, .. })
        ));
    }

    #[test]
    fn test_presence_state_serializes_screaming() {
        let json = serde_json::to_value(PresenceState::Online).unwrap();
        assert_eq!(json, serde_json::json!("ONLINE"));
    }

    proptest! {
        #[test]
        fn prop_dm_key_is_order_independent(a in any::<u128>(), b in any::<u128>()) {
            prop_assume!(a != b);
            let (a, b) = (user(a), user(b));
            prop_assert_eq!(DmKey::for_pair(a, b).unwrap(), DmKey::for_pair(b, a).unwrap());
        }
    }
}
