//! Parley Core - Entity Types and Policies
//!
//! Data types shared by every Parley crate: identifiers, chat/message
//! entities, presence records, the error taxonomy, configuration, and the
//! keyset pagination policy. No I/O lives here.

pub mod config;
pub mod entities;
pub mod error;
pub mod identity;
pub mod pagination;

pub use config::{CacheTtls, ParleyConfig};
pub use entities::{
    ChatDetail, ChatIdentity, ChatSummary, DmKey, Message, MessagePage, MessagePreview,
    Notification, NotificationPage, PageMeta, Participant, PresenceRecord, PresenceState,
    DM_KEY_SEPARATOR,
};
pub use error::{
    ConfigError, KvError, ParleyError, ParleyResult, StorageError, ValidationError,
};
pub use identity::{
    new_entity_id, ChatId, EntityIdType, EntityKind, MessageId, NotificationId, Timestamp, UserId,
};
pub use pagination::{
    paginate, window, Cursor, FeedOrder, Keyset, Page, PageLimits, PageRequest, Window,
    WindowRequest,
};
