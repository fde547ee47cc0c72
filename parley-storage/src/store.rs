//! Relational store collaborator.
//!
//! [`ChatStore`] is everything the chat service needs from the source of
//! truth; [`DirectChatStore`] is the narrow slice the DM resolver uses.
//! [`InMemoryChatStore`] implements both over process memory and enforces
//! the same uniqueness rule as the SQL schema: at most one non-group chat
//! per DM key.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use parley_core::{
    paginate, window, ChatDetail, ChatId, ChatIdentity, ChatSummary, DmKey, EntityKind,
    FeedOrder, Message, MessageId, Notification, NotificationId, Page, PageRequest,
    ParleyError, ParleyResult, Participant, StorageError, Timestamp, UserId, Window,
    WindowRequest,
};

/// Name of the uniqueness constraint on direct-chat keys.
pub const DM_KEY_CONSTRAINT: &str = "chats_dm_key_unique";

/// A chat to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
    pub chat_id: ChatId,
    pub is_group: bool,
    pub title: Option<String>,
    pub dm_key: Option<DmKey>,
    pub participant_ids: Vec<UserId>,
    pub created_at: Timestamp,
}

impl NewChat {
    pub fn direct(identity: &ChatIdentity, created_at: Timestamp) -> Self {
        Self {
            chat_id: identity.chat_id,
            is_group: false,
            title: None,
            dm_key: identity.dm_key.clone(),
            participant_ids: identity.participant_ids.iter().copied().collect(),
            created_at,
        }
    }

    pub fn group(identity: &ChatIdentity, title: Option<String>, created_at: Timestamp) -> Self {
        Self {
            chat_id: identity.chat_id,
            is_group: true,
            title,
            dm_key: None,
            participant_ids: identity.participant_ids.iter().copied().collect(),
            created_at,
        }
    }
}

/// Operations on direct chats used by the DM resolver.
#[async_trait]
pub trait DirectChatStore: Send + Sync {
    /// The non-group chat carrying `key`, if any.
    async fn find_direct_chat(&self, key: &DmKey) -> ParleyResult<Option<ChatDetail>>;

    /// Insert a non-group chat. Fails with [`StorageError::UniqueViolation`]
    /// when another non-group chat already carries the same key.
    async fn create_direct_chat(&self, chat: NewChat) -> ParleyResult<ChatDetail>;

    /// Non-group chats without a DM key, ordered by chat id, strictly after
    /// `after`.
    async fn dm_backfill_candidates(
        &self,
        after: Option<ChatId>,
        limit: u32,
    ) -> ParleyResult<Vec<ChatIdentity>>;

    /// Persist the canonical key of an existing chat.
    async fn set_dm_key(&self, chat_id: ChatId, key: &DmKey) -> ParleyResult<()>;
}

/// Source of truth for chats, messages and notifications.
#[async_trait]
pub trait ChatStore: DirectChatStore {
    async fn chat_detail(&self, chat_id: ChatId) -> ParleyResult<Option<ChatDetail>>;

    /// Chats `user_id` belongs to, most recently active first.
    async fn chat_list(&self, user_id: UserId) -> ParleyResult<Vec<ChatSummary>>;

    async fn create_group(&self, chat: NewChat) -> ParleyResult<ChatDetail>;

    async fn rename_chat(&self, chat_id: ChatId, title: Option<String>) -> ParleyResult<ChatDetail>;

    /// Add a member; adding an existing member changes nothing.
    async fn add_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        joined_at: Timestamp,
    ) -> ParleyResult<ChatDetail>;

    /// Append a message and bump the chat's activity time.
    async fn insert_message(&self, message: Message) -> ParleyResult<Message>;

    async fn set_pinned(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        pinned: bool,
    ) -> ParleyResult<Message>;

    /// A chat's history, newest first.
    async fn messages(&self, chat_id: ChatId, request: &PageRequest) -> ParleyResult<Page<Message>>;

    /// A chat's pinned messages, newest first.
    async fn pinned_messages(
        &self,
        chat_id: ChatId,
        request: &PageRequest,
    ) -> ParleyResult<Page<Message>>;

    async fn message_window(
        &self,
        chat_id: ChatId,
        request: &WindowRequest,
    ) -> ParleyResult<Window<Message>>;

    async fn insert_notification(&self, notification: Notification) -> ParleyResult<Notification>;

    /// A user's notifications, newest first.
    async fn notifications(
        &self,
        user_id: UserId,
        request: &PageRequest,
    ) -> ParleyResult<Page<Notification>>;

    /// Mark the given notifications read, or all of them for `None`.
    /// Returns how many changed.
    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        ids: Option<&[NotificationId]>,
    ) -> ParleyResult<u64>;

    async fn ping(&self) -> ParleyResult<()>;
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, String>,
    chats: HashMap<ChatId, ChatDetail>,
    messages: HashMap<ChatId, Vec<Message>>,
    notifications: HashMap<UserId, Vec<Notification>>,
}

impl State {
    fn participant(&self, user_id: UserId, joined_at: Timestamp) -> Participant {
        Participant {
            user_id,
            display_name: self
                .users
                .get(&user_id)
                .cloned()
                .unwrap_or_else(|| user_id.to_string()),
            joined_at,
        }
    }

    fn detail_from(&self, chat: NewChat) -> ChatDetail {
        ChatDetail {
            chat_id: chat.chat_id,
            is_group: chat.is_group,
            title: chat.title,
            dm_key: chat.dm_key,
            participants: chat
                .participant_ids
                .iter()
                .map(|id| self.participant(*id, chat.created_at))
                .collect(),
            created_at: chat.created_at,
            updated_at: chat.created_at,
        }
    }

    fn dm_key_taken(&self, key: &DmKey, except: Option<ChatId>) -> bool {
        self.chats.values().any(|c| {
            !c.is_group && c.dm_key.as_ref() == Some(key) && Some(c.chat_id) != except
        })
    }

    fn chat_mut(&mut self, chat_id: ChatId) -> ParleyResult<&mut ChatDetail> {
        self.chats
            .get_mut(&chat_id)
            .ok_or_else(|| ParleyError::not_found(EntityKind::Chat, chat_id))
    }

    fn summary(&self, chat: &ChatDetail) -> ChatSummary {
        let last_message = self.messages.get(&chat.chat_id).and_then(|msgs| {
            msgs.iter()
                .max_by_key(|m| (m.created_at, m.message_id))
                .map(Message::preview)
        });
        ChatSummary {
            chat_id: chat.chat_id,
            is_group: chat.is_group,
            title: chat.title.clone(),
            participant_ids: chat.member_ids(),
            last_message,
            updated_at: chat.updated_at,
        }
    }
}

/// [`ChatStore`] over process memory.
#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    state: RwLock<State>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StorageError> {
        self.state.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StorageError> {
        self.state.write().map_err(|_| StorageError::LockPoisoned)
    }

    /// Record a display name used when the user joins chats.
    pub fn register_user(&self, user_id: UserId, display_name: impl Into<String>) -> ParleyResult<()> {
        self.write()?.users.insert(user_id, display_name.into());
        Ok(())
    }

    /// Insert a chat row as-is, bypassing the DM key constraint. Used to seed
    /// rows that predate canonical keys.
    pub fn seed_chat(&self, chat: ChatDetail) -> ParleyResult<()> {
        self.write()?.chats.insert(chat.chat_id, chat);
        Ok(())
    }

    /// Number of non-group chats carrying `key`.
    pub fn direct_chat_count(&self, key: &DmKey) -> ParleyResult<usize> {
        Ok(self
            .read()?
            .chats
            .values()
            .filter(|c| !c.is_group && c.dm_key.as_ref() == Some(key))
            .count())
    }

    pub fn chat_count(&self) -> ParleyResult<usize> {
        Ok(self.read()?.chats.len())
    }
}

#[async_trait]
impl DirectChatStore for InMemoryChatStore {
    async fn find_direct_chat(&self, key: &DmKey) -> ParleyResult<Option<ChatDetail>> {
        let state = self.read()?;
        Ok(state
            .chats
            .values()
            .find(|c| !c.is_group && c.dm_key.as_ref() == Some(key))
            .cloned())
    }

    async fn create_direct_chat(&self, chat: NewChat) -> ParleyResult<ChatDetail> {
        let mut state = self.write()?;
        if let Some(key) = &chat.dm_key {
            if state.dm_key_taken(key, None) {
                return Err(StorageError::UniqueViolation {
                    constraint: DM_KEY_CONSTRAINT.to_string(),
                }
                .into());
            }
        }
        let detail = state.detail_from(chat);
        state.chats.insert(detail.chat_id, detail.clone());
        Ok(detail)
    }

    async fn dm_backfill_candidates(
        &self,
        after: Option<ChatId>,
        limit: u32,
    ) -> ParleyResult<Vec<ChatIdentity>> {
        let state = self.read()?;
        let mut candidates: Vec<ChatIdentity> = state
            .chats
            .values()
            .filter(|c| !c.is_group && c.dm_key.is_none())
            .filter(|c| after.map_or(true, |after| c.chat_id > after))
            .map(|c| ChatIdentity {
                chat_id: c.chat_id,
                is_group: false,
                participant_ids: c.member_ids().into_iter().collect(),
                dm_key: None,
            })
            .collect();
        candidates.sort_by_key(|c| c.chat_id);
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn set_dm_key(&self, chat_id: ChatId, key: &DmKey) -> ParleyResult<()> {
        let mut state = self.write()?;
        if state.dm_key_taken(key, Some(chat_id)) {
            return Err(StorageError::UniqueViolation {
                constraint: DM_KEY_CONSTRAINT.to_string(),
            }
            .into());
        }
        state.chat_mut(chat_id)?.dm_key = Some(key.clone());
        Ok(())
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn chat_detail(&self, chat_id: ChatId) -> ParleyResult<Option<ChatDetail>> {
        Ok(self.read()?.chats.get(&chat_id).cloned())
    }

    async fn chat_list(&self, user_id: UserId) -> ParleyResult<Vec<ChatSummary>> {
        let state = self.read()?;
        let mut list: Vec<ChatSummary> = state
            .chats
            .values()
            .filter(|c| c.has_member(user_id))
            .map(|c| state.summary(c))
            .collect();
        list.sort_by(|a, b| (b.updated_at, b.chat_id).cmp(&(a.updated_at, a.chat_id)));
        Ok(list)
    }

    async fn create_group(&self, chat: NewChat) -> ParleyResult<ChatDetail> {
        let mut state = self.write()?;
        let detail = state.detail_from(chat);
        state.chats.insert(detail.chat_id, detail.clone());
        Ok(detail)
    }

    async fn rename_chat(&self, chat_id: ChatId, title: Option<String>) -> ParleyResult<ChatDetail> {
        let mut state = self.write()?;
        let chat = state.chat_mut(chat_id)?;
        chat.title = title;
        Ok(chat.clone())
    }

    async fn add_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        joined_at: Timestamp,
    ) -> ParleyResult<ChatDetail> {
        let mut state = self.write()?;
        let participant = state.participant(user_id, joined_at);
        let chat = state.chat_mut(chat_id)?;
        if !chat.has_member(user_id) {
            chat.participants.push(participant);
        }
        Ok(chat.clone())
    }

    async fn insert_message(&self, message: Message) -> ParleyResult<Message> {
        let mut state = self.write()?;
        let chat = state.chat_mut(message.chat_id)?;
        chat.updated_at = chat.updated_at.max(message.created_at);
        state
            .messages
            .entry(message.chat_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn set_pinned(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        pinned: bool,
    ) -> ParleyResult<Message> {
        let mut state = self.write()?;
        let message = state
            .messages
            .get_mut(&chat_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.message_id == message_id))
            .ok_or_else(|| ParleyError::not_found(EntityKind::Message, message_id))?;
        message.pinned = pinned;
        Ok(message.clone())
    }

    async fn messages(&self, chat_id: ChatId, request: &PageRequest) -> ParleyResult<Page<Message>> {
        let state = self.read()?;
        let feed = state.messages.get(&chat_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(paginate(feed, FeedOrder::NewestFirst, request)?)
    }

    async fn pinned_messages(
        &self,
        chat_id: ChatId,
        request: &PageRequest,
    ) -> ParleyResult<Page<Message>> {
        let state = self.read()?;
        let feed: Vec<Message> = state
            .messages
            .get(&chat_id)
            .map(|msgs| msgs.iter().filter(|m| m.pinned).cloned().collect())
            .unwrap_or_default();
        Ok(paginate(&feed, FeedOrder::NewestFirst, request)?)
    }

    async fn message_window(
        &self,
        chat_id: ChatId,
        request: &WindowRequest,
    ) -> ParleyResult<Window<Message>> {
        let state = self.read()?;
        let feed = state.messages.get(&chat_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(window(feed, request)?)
    }

    async fn insert_notification(&self, notification: Notification) -> ParleyResult<Notification> {
        self.write()?
            .notifications
            .entry(notification.user_id)
            .or_default()
            .push(notification.clone());
        Ok(notification)
    }

    async fn notifications(
        &self,
        user_id: UserId,
        request: &PageRequest,
    ) -> ParleyResult<Page<Notification>> {
        let state = self.read()?;
        let feed = state
            .notifications
            .get(&user_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(paginate(feed, FeedOrder::NewestFirst, request)?)
    }

    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        ids: Option<&[NotificationId]>,
    ) -> ParleyResult<u64> {
        let mut state = self.write()?;
        let mut changed = 0;
        if let Some(feed) = state.notifications.get_mut(&user_id) {
            for n in feed
                .iter_mut()
                .filter(|n| !n.read && ids.map_or(true, |ids| ids.contains(&n.notification_id)))
            {
                n.read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn ping(&self) -> ParleyResult<()> {
        self.read()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use parley_core::{EntityIdType, PageLimits};

    fn dm(a: UserId, b: UserId) -> NewChat {
        let identity = ChatIdentity::direct(ChatId::now_v7(), a, b).unwrap();
        NewChat::direct(&identity, Utc::now())
    }

    fn message(chat_id: ChatId, sender: UserId, body: &str, at: Timestamp) -> Message {
        Message {
            message_id: MessageId::now_v7(),
            chat_id,
            sender_id: sender,
            body: body.to_string(),
            pinned: false,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_duplicate_dm_key_is_unique_violation() {
        let store = InMemoryChatStore::new();
        let (a, b) = (UserId::now_v7(), UserId::now_v7());

        store.create_direct_chat(dm(a, b)).await.unwrap();
        let err = store.create_direct_chat(dm(b, a)).await.unwrap_err();
        assert!(err.is_unique_violation());

        let key = DmKey::for_pair(a, b).unwrap();
        assert_eq!(store.direct_chat_count(&key).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_groups_do_not_claim_dm_keys() {
        let store = InMemoryChatStore::new();
        let (a, b) = (UserId::now_v7(), UserId::now_v7());
        let group = ChatIdentity::group(ChatId::now_v7(), [a, b]);
        store
            .create_group(NewChat::group(&group, Some("pair".to_string()), Utc::now()))
            .await
            .unwrap();

        let key = DmKey::for_pair(a, b).unwrap();
        assert!(store.find_direct_chat(&key).await.unwrap().is_none());
        store.create_direct_chat(dm(a, b)).await.unwrap();
    }

    #[tokio::test]
    async fn test_display_names_resolved_from_users() {
        let store = InMemoryChatStore::new();
        let (a, b) = (UserId::now_v7(), UserId::now_v7());
        store.register_user(a, "Ada").unwrap();

        let detail = store.create_direct_chat(dm(a, b)).await.unwrap();
        let ada = detail.participants.iter().find(|p| p.user_id == a).unwrap();
        let other = detail.participants.iter().find(|p| p.user_id == b).unwrap();
        assert_eq!(ada.display_name, "Ada");
        assert_eq!(other.display_name, b.to_string());
    }

    #[tokio::test]
    async fn test_chat_list_orders_by_activity_with_preview() {
        let store = InMemoryChatStore::new();
        let me = UserId::now_v7();
        let older = store.create_direct_chat(dm(me, UserId::now_v7())).await.unwrap();
        let newer = store.create_direct_chat(dm(me, UserId::now_v7())).await.unwrap();

        let later = Utc::now() + Duration::seconds(5);
        store
            .insert_message(message(older.chat_id, me, "bump", later))
            .await
            .unwrap();

        let list = store.chat_list(me).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].chat_id, older.chat_id);
        assert_eq!(list[0].last_message.as_ref().unwrap().body, "bump");
        assert_eq!(list[1].chat_id, newer.chat_id);
        assert!(list[1].last_message.is_none());
    }

    #[tokio::test]
    async fn test_pinned_feed_only_holds_pinned() {
        let store = InMemoryChatStore::new();
        let me = UserId::now_v7();
        let chat = store.create_direct_chat(dm(me, UserId::now_v7())).await.unwrap();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let m = message(chat.chat_id, me, &format!("m{i}"), base + Duration::seconds(i));
            ids.push(m.message_id);
            store.insert_message(m).await.unwrap();
        }
        store.set_pinned(chat.chat_id, ids[1], true).await.unwrap();
        store.set_pinned(chat.chat_id, ids[3], true).await.unwrap();

        let limits = PageLimits::new(50, 100);
        let page = store
            .pinned_messages(chat.chat_id, &PageRequest::head(&limits))
            .await
            .unwrap();
        let got: Vec<_> = page.items.iter().map(|m| m.message_id).collect();
        assert_eq!(got, vec![ids[3], ids[1]]);
    }

    #[tokio::test]
    async fn test_backfill_candidates_page_by_id() {
        let store = InMemoryChatStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            let (a, b) = (UserId::now_v7(), UserId::now_v7());
            store
                .seed_chat(ChatDetail {
                    chat_id: ChatId::now_v7(),
                    is_group: false,
                    title: None,
                    dm_key: None,
                    participants: [a, b]
                        .iter()
                        .map(|id| Participant {
                            user_id: *id,
                            display_name: id.to_string(),
                            joined_at: now,
                        })
                        .collect(),
                    created_at: now,
                    updated_at: now,
                })
                .unwrap();
        }
        store.create_direct_chat(dm(UserId::now_v7(), UserId::now_v7())).await.unwrap();

        let first = store.dm_backfill_candidates(None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = store
            .dm_backfill_candidates(Some(first[1].chat_id), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].chat_id > first[1].chat_id);
    }

    #[tokio::test]
    async fn test_mark_notifications_read() {
        let store = InMemoryChatStore::new();
        let user = UserId::now_v7();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let n = Notification {
                notification_id: NotificationId::now_v7(),
                user_id: user,
                kind: "mention".to_string(),
                payload: serde_json::json!({}),
                read: false,
                created_at: Utc::now(),
            };
            ids.push(n.notification_id);
            store.insert_notification(n).await.unwrap();
        }

        assert_eq!(store.mark_notifications_read(user, Some(&ids[..1])).await.unwrap(), 1);
        assert_eq!(store.mark_notifications_read(user, None).await.unwrap(), 2);
        assert_eq!(store.mark_notifications_read(user, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_chat_is_not_found() {
        let store = InMemoryChatStore::new();
        let err = store
            .rename_chat(ChatId::now_v7(), Some("x".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::NotFound { entity: EntityKind::Chat, .. }));
    }
}
