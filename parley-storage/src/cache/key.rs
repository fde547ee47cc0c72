//! Cache kinds and deterministic cache keys.
//!
//! A [`CacheKey`] can only be built through the per-kind constructors, so a
//! key always pairs a kind with the id that scopes it (the owning user for
//! list-type kinds, the chat otherwise). Paged kinds only ever name their
//! head page.

use std::fmt;
use std::time::Duration;

use parley_core::{CacheTtls, ChatId, EntityIdType, UserId};
use uuid::Uuid;

/// The cached views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    ChatList,
    ChatDetail,
    MessagePage,
    PinnedPage,
    NotificationPage,
}

impl CacheKind {
    pub const ALL: [CacheKind; 5] = [
        CacheKind::ChatList,
        CacheKind::ChatDetail,
        CacheKind::MessagePage,
        CacheKind::PinnedPage,
        CacheKind::NotificationPage,
    ];

    /// Lifetime of an entry of this kind.
    pub fn ttl(&self, ttls: &CacheTtls) -> Duration {
        match self {
            Self::ChatList => ttls.chat_list,
            Self::ChatDetail => ttls.chat_detail,
            Self::MessagePage => ttls.message_page,
            Self::PinnedPage => ttls.pinned_page,
            Self::NotificationPage => ttls.notification_page,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatList => "chat_list",
            Self::ChatDetail => "chat_detail",
            Self::MessagePage => "message_page",
            Self::PinnedPage => "pinned_page",
            Self::NotificationPage => "notification_page",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    inner: KeyInner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct KeyInner {
    kind: CacheKind,
    scope: Uuid,
}

impl CacheKey {
    fn new(kind: CacheKind, scope: Uuid) -> Self {
        Self {
            inner: KeyInner { kind, scope },
        }
    }

    /// A user's chat list.
    pub fn chat_list(user_id: UserId) -> Self {
        Self::new(CacheKind::ChatList, user_id.as_uuid())
    }

    /// A chat with its participants.
    pub fn chat_detail(chat_id: ChatId) -> Self {
        Self::new(CacheKind::ChatDetail, chat_id.as_uuid())
    }

    /// The newest page of a chat's history.
    pub fn message_head(chat_id: ChatId) -> Self {
        Self::new(CacheKind::MessagePage, chat_id.as_uuid())
    }

    /// The newest page of a chat's pinned messages.
    pub fn pinned_head(chat_id: ChatId) -> Self {
        Self::new(CacheKind::PinnedPage, chat_id.as_uuid())
    }

    /// The newest page of a user's notifications.
    pub fn notification_head(user_id: UserId) -> Self {
        Self::new(CacheKind::NotificationPage, user_id.as_uuid())
    }

    pub fn kind(&self) -> CacheKind {
        self.inner.kind
    }

    pub fn scope(&self) -> Uuid {
        self.inner.scope
    }

    /// Render the store key, prefixed with `namespace` unless it is empty.
    pub fn render(&self, namespace: &str) -> String {
        if namespace.is_empty() {
            self.to_string()
        } else {
            format!("{namespace}:{self}")
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = self.inner.scope;
        match self.inner.kind {
            CacheKind::ChatList => write!(f, "chat_list:{scope}"),
            CacheKind::ChatDetail => write!(f, "chat_detail:{scope}"),
            CacheKind::MessagePage => write!(f, "messages:{scope}:head"),
            CacheKind::PinnedPage => write!(f, "pinned:{scope}:head"),
            CacheKind::NotificationPage => write!(f, "notifications:{scope}:head"),
        }
    }
}
