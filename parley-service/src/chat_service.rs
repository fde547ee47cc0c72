//! Chat Service
//!
//! Cached reads and write-then-invalidate writes over a [`ChatStore`].
//!
//! Reads go through the [`ReadThroughCache`]; only head pages of the paged
//! feeds are cached, so the set of keys a write can stale is a closed
//! function of the entity it touched. Writes commit to the store first and
//! evict that set afterwards. Membership is checked on every chat-scoped
//! call against the (shared, user-independent) chat detail; the resulting
//! `Forbidden` is never cached.

use chrono::Utc;
use parley_core::{
    ChatDetail, ChatId, ChatIdentity, ChatSummary, Cursor, EntityIdType, EntityKind, Message,
    MessageId, MessagePage, Notification, NotificationId, NotificationPage, PageLimits,
    PageRequest, ParleyConfig, ParleyError, ParleyResult, UserId, ValidationError, Window,
    WindowRequest,
};
use parley_storage::{CacheKey, ChatStore, KeyValueStore, NewChat, ReadThroughCache};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::dm::{DmKeyResolver, DmResolution};

/// Longest accepted message body, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Chat reads and writes with cache maintenance.
pub struct ChatService<K: KeyValueStore, S: ChatStore> {
    store: Arc<S>,
    cache: ReadThroughCache<K>,
    dm: DmKeyResolver<S>,
    message_limits: PageLimits,
    notification_limits: PageLimits,
}

impl<K: KeyValueStore, S: ChatStore> Clone for ChatService<K, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            dm: self.dm.clone(),
            message_limits: self.message_limits,
            notification_limits: self.notification_limits,
        }
    }
}

impl<K: KeyValueStore, S: ChatStore> ChatService<K, S> {
    pub fn new(store: Arc<S>, cache: ReadThroughCache<K>, config: &ParleyConfig) -> Self {
        Self {
            dm: DmKeyResolver::from_config(Arc::clone(&store), config),
            store,
            cache,
            message_limits: config.message_limits,
            notification_limits: config.notification_limits,
        }
    }

    pub fn cache(&self) -> &ReadThroughCache<K> {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dm_resolver(&self) -> &DmKeyResolver<S> {
        &self.dm
    }

    // ========================================================================
    // MEMBERSHIP
    // ========================================================================

    async fn load_detail(&self, chat_id: ChatId) -> ParleyResult<ChatDetail> {
        let store = &self.store;
        self.cache
            .read(&CacheKey::chat_detail(chat_id), || async move {
                store
                    .chat_detail(chat_id)
                    .await?
                    .ok_or_else(|| ParleyError::not_found(EntityKind::Chat, chat_id))
            })
            .await
    }

    /// The chat's detail, provided `user_id` belongs to it.
    async fn member_detail(&self, user_id: UserId, chat_id: ChatId) -> ParleyResult<ChatDetail> {
        let detail = self.load_detail(chat_id).await?;
        if !detail.has_member(user_id) {
            debug!(%user_id, %chat_id, "Rejected non-member");
            return Err(ParleyError::Forbidden { user_id, chat_id });
        }
        Ok(detail)
    }

    async fn evict(&self, keys: impl IntoIterator<Item = CacheKey>) {
        self.cache.invalidate_many(keys).await;
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Chats `user_id` belongs to, most recently active first.
    #[instrument(skip(self))]
    pub async fn chat_list(&self, user_id: UserId) -> ParleyResult<Vec<ChatSummary>> {
        let store = &self.store;
        self.cache
            .read(&CacheKey::chat_list(user_id), || async move {
                store.chat_list(user_id).await
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn chat_detail(&self, user_id: UserId, chat_id: ChatId) -> ParleyResult<ChatDetail> {
        self.member_detail(user_id, chat_id).await
    }

    /// A page of chat history, newest first.
    #[instrument(skip(self))]
    pub async fn messages(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        cursor: Option<Cursor>,
        limit: Option<u32>,
    ) -> ParleyResult<MessagePage> {
        self.member_detail(user_id, chat_id).await?;
        let request = PageRequest::new(cursor, limit, &self.message_limits);

        let store = &self.store;
        let load = || async move {
            let page = store.messages(chat_id, &request).await?;
            Ok::<_, ParleyError>(MessagePage::from_page(page, request.limit))
        };

        if request.is_head_of(&self.message_limits) {
            self.cache.read(&CacheKey::message_head(chat_id), load).await
        } else {
            load().await
        }
    }

    /// Messages around `anchor`, both sides chronological.
    #[instrument(skip(self))]
    pub async fn message_window(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        anchor: MessageId,
        before: Option<u32>,
        after: Option<u32>,
    ) -> ParleyResult<Window<Message>> {
        self.member_detail(user_id, chat_id).await?;
        let request = WindowRequest::new(Cursor::from_id(anchor), before, after, &self.message_limits);
        self.store.message_window(chat_id, &request).await
    }

    /// A page of pinned messages, newest first.
    #[instrument(skip(self))]
    pub async fn pinned_messages(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        cursor: Option<Cursor>,
        limit: Option<u32>,
    ) -> ParleyResult<MessagePage> {
        self.member_detail(user_id, chat_id).await?;
        let request = PageRequest::new(cursor, limit, &self.message_limits);

        let store = &self.store;
        let load = || async move {
            let page = store.pinned_messages(chat_id, &request).await?;
            Ok::<_, ParleyError>(MessagePage::from_page(page, request.limit))
        };

        if request.is_head_of(&self.message_limits) {
            self.cache.read(&CacheKey::pinned_head(chat_id), load).await
        } else {
            load().await
        }
    }

    /// A page of the user's notifications, newest first.
    #[instrument(skip(self))]
    pub async fn notifications(
        &self,
        user_id: UserId,
        cursor: Option<Cursor>,
        limit: Option<u32>,
    ) -> ParleyResult<NotificationPage> {
        let request = PageRequest::new(cursor, limit, &self.notification_limits);

        let store = &self.store;
        let load = || async move {
            let page = store.notifications(user_id, &request).await?;
            Ok::<_, ParleyError>(NotificationPage::from_page(page, request.limit))
        };

        if request.is_head_of(&self.notification_limits) {
            self.cache.read(&CacheKey::notification_head(user_id), load).await
        } else {
            load().await
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Open (or reopen) the direct chat between `user_id` and `other`.
    #[instrument(skip(self))]
    pub async fn start_direct_chat(&self, user_id: UserId, other: UserId) -> ParleyResult<DmResolution> {
        let resolution = self.dm.get_or_create(user_id, other).await?;
        if resolution.created {
            self.evict(resolution.chat.member_ids().into_iter().map(CacheKey::chat_list))
                .await;
        }
        Ok(resolution)
    }

    /// Create a group chat; the creator is always a member.
    #[instrument(skip(self, members))]
    pub async fn create_group(
        &self,
        user_id: UserId,
        title: Option<String>,
        members: &[UserId],
    ) -> ParleyResult<ChatDetail> {
        let title = normalize_title(title)?;
        let identity = ChatIdentity::group(
            ChatId::now_v7(),
            std::iter::once(user_id).chain(members.iter().copied()),
        );
        let chat = self
            .store
            .create_group(NewChat::group(&identity, title, Utc::now()))
            .await?;

        self.evict(chat.member_ids().into_iter().map(CacheKey::chat_list))
            .await;
        Ok(chat)
    }

    #[instrument(skip(self, body))]
    pub async fn send_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        body: &str,
    ) -> ParleyResult<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(invalid("body", "must not be empty"));
        }
        if body.chars().count() > MAX_MESSAGE_CHARS {
            return Err(invalid(
                "body",
                &format!("must be at most {MAX_MESSAGE_CHARS} characters"),
            ));
        }

        let detail = self.member_detail(user_id, chat_id).await?;
        let message = self
            .store
            .insert_message(Message {
                message_id: MessageId::now_v7(),
                chat_id,
                sender_id: user_id,
                body: body.to_string(),
                pinned: false,
                created_at: Utc::now(),
            })
            .await?;

        let lists = detail.member_ids().into_iter().map(CacheKey::chat_list);
        self.evict(
            lists.chain([CacheKey::chat_detail(chat_id), CacheKey::message_head(chat_id)]),
        )
        .await;
        Ok(message)
    }

    #[instrument(skip(self))]
    pub async fn rename_chat(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        title: Option<String>,
    ) -> ParleyResult<ChatDetail> {
        let title = normalize_title(title)?;
        self.member_detail(user_id, chat_id).await?;
        let chat = self.store.rename_chat(chat_id, title).await?;

        let lists = chat.member_ids().into_iter().map(CacheKey::chat_list);
        self.evict(lists.chain([CacheKey::chat_detail(chat_id)])).await;
        Ok(chat)
    }

    /// Add `new_member` to a group chat. Direct chats stay two-party.
    #[instrument(skip(self))]
    pub async fn add_participant(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        new_member: UserId,
    ) -> ParleyResult<ChatDetail> {
        let detail = self.member_detail(user_id, chat_id).await?;
        if !detail.is_group {
            return Err(invalid("chat_id", "members cannot be added to a direct chat"));
        }
        let chat = self
            .store
            .add_participant(chat_id, new_member, Utc::now())
            .await?;

        let lists = chat.member_ids().into_iter().map(CacheKey::chat_list);
        self.evict(lists.chain([CacheKey::chat_detail(chat_id)])).await;
        Ok(chat)
    }

    #[instrument(skip(self))]
    pub async fn set_pinned(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        pinned: bool,
    ) -> ParleyResult<Message> {
        self.member_detail(user_id, chat_id).await?;
        let message = self.store.set_pinned(chat_id, message_id, pinned).await?;
        self.evict([CacheKey::pinned_head(chat_id), CacheKey::message_head(chat_id)])
            .await;
        Ok(message)
    }

    /// Deliver a notification to `user_id`.
    #[instrument(skip(self, payload))]
    pub async fn notify(
        &self,
        user_id: UserId,
        kind: &str,
        payload: serde_json::Value,
    ) -> ParleyResult<Notification> {
        if kind.trim().is_empty() {
            return Err(invalid("kind", "must not be empty"));
        }
        let notification = self
            .store
            .insert_notification(Notification {
                notification_id: NotificationId::now_v7(),
                user_id,
                kind: kind.to_string(),
                payload,
                read: false,
                created_at: Utc::now(),
            })
            .await?;
        self.evict([CacheKey::notification_head(user_id)]).await;
        Ok(notification)
    }

    /// Mark some (or, for `None`, all) of a user's notifications read.
    #[instrument(skip(self, ids))]
    pub async fn mark_notifications_read(
        &self,
        user_id: UserId,
        ids: Option<&[NotificationId]>,
    ) -> ParleyResult<u64> {
        let changed = self.store.mark_notifications_read(user_id, ids).await?;
        if changed > 0 {
            self.evict([CacheKey::notification_head(user_id)]).await;
        }
        Ok(changed)
    }
}

fn invalid(field: &str, reason: &str) -> ParleyError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Trim a title; blank means no title.
fn normalize_title(title: Option<String>) -> ParleyResult<Option<String>> {
    match title.map(|t| t.trim().to_string()) {
        Some(t) if t.is_empty() => Ok(None),
        Some(t) if t.chars().count() > 200 => Err(invalid("title", "must be at most 200 characters")),
        other => Ok(other),
    }
}
