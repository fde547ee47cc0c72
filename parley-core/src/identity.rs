//! Identity types for Parley entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// Common behaviour of the strongly-typed entity identifiers.
pub trait EntityIdType: Copy + Eq + Ord + fmt::Display {
    /// Wrap a raw UUID.
    fn new(id: Uuid) -> Self;

    /// Borrow the raw UUID.
    fn as_uuid(&self) -> Uuid;

    /// Generate a fresh, timestamp-sortable identifier.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            fn new(id: Uuid) -> Self {
                Self(id)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_entity_id!(
    /// Identifier of a user account.
    UserId
);
define_entity_id!(
    /// Identifier of a chat (direct or group).
    ChatId
);
define_entity_id!(
    /// Identifier of a message. UUIDv7, so it doubles as a tie-breaker in feed order.
    MessageId
);
define_entity_id!(
    /// Identifier of an in-app notification.
    NotificationId
);

/// Entity discriminator used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    User,
    Chat,
    Message,
    Notification,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
