//! PostgreSQL Chat Store
//!
//! [`PgChatStore`] implements [`ChatStore`] over a deadpool-postgres pool.
//! Feeds are served with keyset predicates on `(created_at, id)` so a page
//! boundary never shifts when newer rows arrive. The schema lives in
//! `migrations/001_init.sql` and is applied by [`PgChatStore::migrate`].

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use parley_core::{
    ChatDetail, ChatId, ChatIdentity, ChatSummary, ConfigError, Cursor, DmKey, EntityIdType, EntityKind,
    Message, MessageId, MessagePreview, Notification, NotificationId, Page, PageRequest,
    ParleyError, ParleyResult, Participant, StorageError, Timestamp, UserId, Window,
    WindowRequest,
};
use parley_storage::{ChatStore, DirectChatStore, NewChat};
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::{GenericClient, NoTls, Row};
use tracing::{debug, error};
use uuid::Uuid;

/// Initial schema, applied by [`PgChatStore::migrate`].
pub const INIT_MIGRATION: &str = include_str!("../migrations/001_init.sql");

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost:5432/parley";

/// Where the relational store lives and how many connections to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// `postgres://` URL or libpq key/value string.
    pub url: String,
    pub pool_size: usize,
    /// How long a caller waits for a pooled connection.
    pub wait_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            pool_size: 16,
            wait_timeout: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl DbConfig {
    /// Environment variables:
    /// - `PARLEY_DATABASE_URL` (default: local `parley` database)
    /// - `PARLEY_DB_POOL_SIZE` (default: 16)
    /// - `PARLEY_DB_WAIT_MS` (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("PARLEY_DATABASE_URL").unwrap_or(defaults.url),
            pool_size: env_parse("PARLEY_DB_POOL_SIZE").unwrap_or(defaults.pool_size),
            wait_timeout: env_parse("PARLEY_DB_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_timeout),
        }
    }

    /// Parse the connection string.
    pub fn connection(&self) -> ParleyResult<tokio_postgres::Config> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "PARLEY_DATABASE_URL".to_string(),
            }
            .into());
        }
        self.url.parse().map_err(|e: tokio_postgres::Error| {
            // the raw string may carry a password
            ConfigError::InvalidValue {
                field: "PARLEY_DATABASE_URL".to_string(),
                value: "<redacted>".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn validate(&self) -> ParleyResult<()> {
        self.connection()?;
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PARLEY_DB_POOL_SIZE".to_string(),
                value: "0".to_string(),
                reason: "pool needs at least one connection".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Build the pool. No connection is opened until the pool is first used.
    pub fn create_pool(&self) -> ParleyResult<Pool> {
        let manager = Manager::from_config(
            self.connection()?,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(manager)
            .max_size(self.pool_size)
            .wait_timeout(Some(self.wait_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                StorageError::Pool {
                    reason: format!("Failed to create pool: {e}"),
                }
                .into()
            })
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn db_err(e: tokio_postgres::Error) -> ParleyError {
    if let Some(db_error) = e.as_db_error() {
        if db_error.code() == &SqlState::UNIQUE_VIOLATION {
            return StorageError::UniqueViolation {
                constraint: db_error.constraint().unwrap_or("unknown").to_string(),
            }
            .into();
        }
    }
    error!(error = %e, "Database error");
    StorageError::Database {
        reason: e.to_string(),
    }
    .into()
}

fn pool_err(e: PoolError) -> ParleyError {
    let reason = match e {
        PoolError::Timeout(_) => "timed out waiting for a connection".to_string(),
        PoolError::Closed => "pool is closed".to_string(),
        other => other.to_string(),
    };
    error!(reason = %reason, "Connection pool error");
    StorageError::Pool { reason }.into()
}

fn invalid_cursor(cursor: Cursor) -> ParleyError {
    StorageError::InvalidCursor {
        cursor: cursor.to_string(),
    }
    .into()
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn message_from_row(row: &Row) -> ParleyResult<Message> {
    Ok(Message {
        message_id: MessageId::new(row.try_get("id").map_err(db_err)?),
        chat_id: ChatId::new(row.try_get("chat_id").map_err(db_err)?),
        sender_id: UserId::new(row.try_get("sender_id").map_err(db_err)?),
        body: row.try_get("body").map_err(db_err)?,
        pinned: row.try_get("pinned").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn notification_from_row(row: &Row) -> ParleyResult<Notification> {
    Ok(Notification {
        notification_id: NotificationId::new(row.try_get("id").map_err(db_err)?),
        user_id: UserId::new(row.try_get("user_id").map_err(db_err)?),
        kind: row.try_get("kind").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        read: row.try_get("read").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn participant_ids(row: &Row) -> ParleyResult<Vec<UserId>> {
    let ids: Vec<Uuid> = row.try_get("participant_ids").map_err(db_err)?;
    Ok(ids.into_iter().map(UserId::new).collect())
}

// ============================================================================
// STORE
// ============================================================================

/// Relational source of truth backed by PostgreSQL.
#[derive(Clone)]
pub struct PgChatStore {
    pool: Pool,
}

impl PgChatStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> ParleyResult<Self> {
        let pool = config.create_pool()?;
        Ok(Self::new(pool))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> ParleyResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_err)
    }

    /// Apply the bundled schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> ParleyResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(INIT_MIGRATION).await.map_err(db_err)?;
        debug!("Schema migration applied");
        Ok(())
    }

    /// Insert or rename a user; display names feed chat detail.
    pub async fn upsert_user(&self, user_id: UserId, display_name: &str) -> ParleyResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO users (id, display_name) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name",
            &[&user_id.as_uuid(), &display_name],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_detail<C: GenericClient + Sync>(
        client: &C,
        chat_id: ChatId,
    ) -> ParleyResult<Option<ChatDetail>> {
        let id = chat_id.as_uuid();
        let Some(row) = client
            .query_opt(
                "SELECT id, is_group, title, dm_key, created_at, updated_at
                 FROM chats WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };

        let participants = client
            .query(
                "SELECT p.user_id, COALESCE(u.display_name, p.user_id::text) AS display_name,
                        p.joined_at
                 FROM chat_participants p
                 LEFT JOIN users u ON u.id = p.user_id
                 WHERE p.chat_id = $1
                 ORDER BY p.joined_at, p.user_id",
                &[&id],
            )
            .await
            .map_err(db_err)?
            .iter()
            .map(|r| {
                Ok(Participant {
                    user_id: UserId::new(r.try_get("user_id").map_err(db_err)?),
                    display_name: r.try_get("display_name").map_err(db_err)?,
                    joined_at: r.try_get("joined_at").map_err(db_err)?,
                })
            })
            .collect::<ParleyResult<Vec<_>>>()?;

        let dm_key: Option<String> = row.try_get("dm_key").map_err(db_err)?;
        Ok(Some(ChatDetail {
            chat_id,
            is_group: row.try_get("is_group").map_err(db_err)?,
            title: row.try_get("title").map_err(db_err)?,
            dm_key: dm_key.map(DmKey::from_stored),
            participants,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        }))
    }

    async fn insert_chat(&self, chat: NewChat) -> ParleyResult<ChatDetail> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        let id = chat.chat_id.as_uuid();
        let dm_key = chat.dm_key.as_ref().map(DmKey::as_str);
        tx.execute(
            "INSERT INTO chats (id, is_group, title, dm_key, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)",
            &[&id, &chat.is_group, &chat.title, &dm_key, &chat.created_at],
        )
        .await
        .map_err(db_err)?;

        for user_id in &chat.participant_ids {
            tx.execute(
                "INSERT INTO chat_participants (chat_id, user_id, joined_at)
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                &[&id, &user_id.as_uuid(), &chat.created_at],
            )
            .await
            .map_err(db_err)?;
        }

        let detail = Self::load_detail(&*tx, chat.chat_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(EntityKind::Chat, chat.chat_id))?;
        tx.commit().await.map_err(db_err)?;
        Ok(detail)
    }

    /// `(created_at, id)` of the cursor row, restricted to the feed it must
    /// belong to.
    async fn message_anchor<C: GenericClient + Sync>(
        client: &C,
        chat_id: ChatId,
        cursor: Cursor,
        pinned_only: bool,
    ) -> ParleyResult<(Timestamp, Uuid)> {
        let row = client
            .query_opt(
                "SELECT created_at, id FROM messages
                 WHERE id = $1 AND chat_id = $2 AND (pinned OR NOT $3)",
                &[&cursor.as_uuid(), &chat_id.as_uuid(), &pinned_only],
            )
            .await
            .map_err(db_err)?
            .ok_or_else(|| invalid_cursor(cursor))?;
        Ok((
            row.try_get("created_at").map_err(db_err)?,
            row.try_get("id").map_err(db_err)?,
        ))
    }

    async fn message_feed(
        &self,
        chat_id: ChatId,
        request: &PageRequest,
        pinned_only: bool,
    ) -> ParleyResult<Page<Message>> {
        let conn = self.get_conn().await?;
        let chat = chat_id.as_uuid();
        let limit = i64::from(request.limit);

        let rows = match request.cursor {
            None => conn
                .query(
                    "SELECT id, chat_id, sender_id, body, pinned, created_at FROM messages
                         WHERE chat_id = $1 AND (pinned OR NOT $2)
                         ORDER BY created_at DESC, id DESC LIMIT $3",
                    &[&chat, &pinned_only, &limit],
                )
                .await
                .map_err(db_err)?,
            Some(cursor) => {
                let (at, id) = Self::message_anchor(&**conn, chat_id, cursor, pinned_only).await?;
                conn.query(
                    "SELECT id, chat_id, sender_id, body, pinned, created_at FROM messages
                         WHERE chat_id = $1 AND (pinned OR NOT $2)
                           AND (created_at, id) < ($3, $4)
                         ORDER BY created_at DESC, id DESC LIMIT $5",
                    &[&chat, &pinned_only, &at, &id, &limit],
                )
                .await
                .map_err(db_err)?
            }
        };

        let items = rows
            .iter()
            .map(message_from_row)
            .collect::<ParleyResult<Vec<_>>>()?;
        Ok(Page::from_items(items, request.limit))
    }
}

#[async_trait]
impl DirectChatStore for PgChatStore {
    async fn find_direct_chat(&self, key: &DmKey) -> ParleyResult<Option<ChatDetail>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT id FROM chats WHERE dm_key = $1 AND NOT is_group",
                &[&key.as_str()],
            )
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let id: Uuid = row.try_get("id").map_err(db_err)?;
                Self::load_detail(&**conn, ChatId::new(id)).await
            }
            None => Ok(None),
        }
    }

    async fn create_direct_chat(&self, chat: NewChat) -> ParleyResult<ChatDetail> {
        self.insert_chat(chat).await
    }

    async fn dm_backfill_candidates(
        &self,
        after: Option<ChatId>,
        limit: u32,
    ) -> ParleyResult<Vec<ChatIdentity>> {
        let conn = self.get_conn().await?;
        let after = after.map(|id| id.as_uuid());
        let rows = conn
            .query(
                "SELECT c.id,
                        ARRAY(SELECT p.user_id FROM chat_participants p WHERE p.chat_id = c.id)
                            AS participant_ids
                 FROM chats c
                 WHERE NOT c.is_group AND c.dm_key IS NULL
                   AND ($1::uuid IS NULL OR c.id > $1)
                 ORDER BY c.id
                 LIMIT $2",
                &[&after, &i64::from(limit)],
            )
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(ChatIdentity {
                    chat_id: ChatId::new(row.try_get("id").map_err(db_err)?),
                    is_group: false,
                    participant_ids: participant_ids(row)?.into_iter().collect(),
                    dm_key: None,
                })
            })
            .collect()
    }

    async fn set_dm_key(&self, chat_id: ChatId, key: &DmKey) -> ParleyResult<()> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE chats SET dm_key = $2 WHERE id = $1 AND NOT is_group",
                &[&chat_id.as_uuid(), &key.as_str()],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(ParleyError::not_found(EntityKind::Chat, chat_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn chat_detail(&self, chat_id: ChatId) -> ParleyResult<Option<ChatDetail>> {
        let conn = self.get_conn().await?;
        Self::load_detail(&**conn, chat_id).await
    }

    async fn chat_list(&self, user_id: UserId) -> ParleyResult<Vec<ChatSummary>> {
        let conn = self.get_conn().await?;
        let rows = conn
            .query(
                "SELECT c.id, c.is_group, c.title, c.updated_at,
                        ARRAY(SELECT p.user_id FROM chat_participants p
                              WHERE p.chat_id = c.id
                              ORDER BY p.joined_at, p.user_id) AS participant_ids,
                        lm.id AS last_id, lm.sender_id AS last_sender,
                        lm.body AS last_body, lm.created_at AS last_at
                 FROM chats c
                 JOIN chat_participants me ON me.chat_id = c.id AND me.user_id = $1
                 LEFT JOIN LATERAL (
                     SELECT m.id, m.sender_id, m.body, m.created_at
                     FROM messages m
                     WHERE m.chat_id = c.id
                     ORDER BY m.created_at DESC, m.id DESC
                     LIMIT 1
                 ) lm ON TRUE
                 ORDER BY c.updated_at DESC, c.id DESC",
                &[&user_id.as_uuid()],
            )
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let last_id: Option<Uuid> = row.try_get("last_id").map_err(db_err)?;
                let last_message = match last_id {
                    Some(id) => {
                        let sender: Uuid = row.try_get("last_sender").map_err(db_err)?;
                        Some(MessagePreview {
                            message_id: MessageId::new(id),
                            sender_id: UserId::new(sender),
                            body: row.try_get("last_body").map_err(db_err)?,
                            created_at: row.try_get("last_at").map_err(db_err)?,
                        })
                    }
                    None => None,
                };
                Ok(ChatSummary {
                    chat_id: ChatId::new(row.try_get("id").map_err(db_err)?),
                    is_group: row.try_get("is_group").map_err(db_err)?,
                    title: row.try_get("title").map_err(db_err)?,
                    participant_ids: participant_ids(row)?,
                    last_message,
                    updated_at: row.try_get("updated_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn create_group(&self, chat: NewChat) -> ParleyResult<ChatDetail> {
        self.insert_chat(chat).await
    }

    async fn rename_chat(&self, chat_id: ChatId, title: Option<String>) -> ParleyResult<ChatDetail> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE chats SET title = $2 WHERE id = $1",
                &[&chat_id.as_uuid(), &title],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(ParleyError::not_found(EntityKind::Chat, chat_id));
        }
        Self::load_detail(&**conn, chat_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(EntityKind::Chat, chat_id))
    }

    async fn add_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        joined_at: Timestamp,
    ) -> ParleyResult<ChatDetail> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        let exists = tx
            .query_opt("SELECT 1 FROM chats WHERE id = $1 FOR UPDATE", &[&chat_id.as_uuid()])
            .await
            .map_err(db_err)?
            .is_some();
        if !exists {
            return Err(ParleyError::not_found(EntityKind::Chat, chat_id));
        }
        tx.execute(
            "INSERT INTO chat_participants (chat_id, user_id, joined_at)
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            &[&chat_id.as_uuid(), &user_id.as_uuid(), &joined_at],
        )
        .await
        .map_err(db_err)?;
        let detail = Self::load_detail(&*tx, chat_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(EntityKind::Chat, chat_id))?;
        tx.commit().await.map_err(db_err)?;
        Ok(detail)
    }

    async fn insert_message(&self, message: Message) -> ParleyResult<Message> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        let bumped = tx
            .execute(
                "UPDATE chats SET updated_at = GREATEST(updated_at, $2) WHERE id = $1",
                &[&message.chat_id.as_uuid(), &message.created_at],
            )
            .await
            .map_err(db_err)?;
        if bumped == 0 {
            return Err(ParleyError::not_found(EntityKind::Chat, message.chat_id));
        }
        tx.execute(
            "INSERT INTO messages (id, chat_id, sender_id, body, pinned, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &message.message_id.as_uuid(),
                &message.chat_id.as_uuid(),
                &message.sender_id.as_uuid(),
                &message.body,
                &message.pinned,
                &message.created_at,
            ],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(message)
    }

    async fn set_pinned(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        pinned: bool,
    ) -> ParleyResult<Message> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "UPDATE messages SET pinned = $3 WHERE chat_id = $1 AND id = $2
                     RETURNING id, chat_id, sender_id, body, pinned, created_at",
                &[&chat_id.as_uuid(), &message_id.as_uuid(), &pinned],
            )
            .await
            .map_err(db_err)?
            .ok_or_else(|| ParleyError::not_found(EntityKind::Message, message_id))?;
        message_from_row(&row)
    }

    async fn messages(&self, chat_id: ChatId, request: &PageRequest) -> ParleyResult<Page<Message>> {
        self.message_feed(chat_id, request, false).await
    }

    async fn pinned_messages(
        &self,
        chat_id: ChatId,
        request: &PageRequest,
    ) -> ParleyResult<Page<Message>> {
        self.message_feed(chat_id, request, true).await
    }

    async fn message_window(
        &self,
        chat_id: ChatId,
        request: &WindowRequest,
    ) -> ParleyResult<Window<Message>> {
        let conn = self.get_conn().await?;
        let chat = chat_id.as_uuid();
        let anchor_row = conn
            .query_opt(
                "SELECT id, chat_id, sender_id, body, pinned, created_at FROM messages WHERE id = $1 AND chat_id = $2",
                &[&request.anchor.as_uuid(), &chat],
            )
            .await
            .map_err(db_err)?
            .ok_or_else(|| invalid_cursor(request.anchor))?;
        let anchor = message_from_row(&anchor_row)?;
        let (at, id) = (anchor.created_at, anchor.message_id.as_uuid());

        let mut before = conn
            .query(
                "SELECT id, chat_id, sender_id, body, pinned, created_at FROM messages
                     WHERE chat_id = $1 AND (created_at, id) < ($2, $3)
                     ORDER BY created_at DESC, id DESC LIMIT $4",
                &[&chat, &at, &id, &i64::from(request.limit_before)],
            )
            .await
            .map_err(db_err)?
            .iter()
            .map(message_from_row)
            .collect::<ParleyResult<Vec<_>>>()?;
        before.reverse();

        let after = conn
            .query(
                "SELECT id, chat_id, sender_id, body, pinned, created_at FROM messages
                     WHERE chat_id = $1 AND (created_at, id) > ($2, $3)
                     ORDER BY created_at ASC, id ASC LIMIT $4",
                &[&chat, &at, &id, &i64::from(request.limit_after)],
            )
            .await
            .map_err(db_err)?
            .iter()
            .map(message_from_row)
            .collect::<ParleyResult<Vec<_>>>()?;

        Ok(Window::assemble(anchor, before, after, request))
    }

    async fn insert_notification(&self, notification: Notification) -> ParleyResult<Notification> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO notifications (id, user_id, kind, payload, read, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &notification.notification_id.as_uuid(),
                &notification.user_id.as_uuid(),
                &notification.kind,
                &notification.payload,
                &notification.read,
                &notification.created_at,
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(notification)
    }

    async fn notifications(
        &self,
        user_id: UserId,
        request: &PageRequest,
    ) -> ParleyResult<Page<Notification>> {
        let conn = self.get_conn().await?;
        let user = user_id.as_uuid();
        let limit = i64::from(request.limit);

        let rows = match request.cursor {
            None => conn
                .query(
                    "SELECT id, user_id, kind, payload, read, created_at FROM notifications
                         WHERE user_id = $1
                         ORDER BY created_at DESC, id DESC LIMIT $2",
                    &[&user, &limit],
                )
                .await
                .map_err(db_err)?,
            Some(cursor) => {
                let anchor = conn
                    .query_opt(
                        "SELECT created_at, id FROM notifications WHERE id = $1 AND user_id = $2",
                        &[&cursor.as_uuid(), &user],
                    )
                    .await
                    .map_err(db_err)?
                    .ok_or_else(|| invalid_cursor(cursor))?;
                let at: Timestamp = anchor.try_get("created_at").map_err(db_err)?;
                let id: Uuid = anchor.try_get("id").map_err(db_err)?;
                conn.query(
                    "SELECT id, user_id, kind, payload, read, created_at FROM notifications
                         WHERE user_id = $1 AND (created_at, id) < ($2, $3)
                         ORDER BY created_at DESC, id DESC LIMIT $4",
                    &[&user, &at, &id, &limit],
                )
                .await
                .map_err(db_err)?
            }
        };

        let items = rows
            .iter()
            .map(notification_from_row)
            .collect::<ParleyResult<Vec<_>>>()?;
        Ok(Page::from_items(items, request.limit))
    }

    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        ids: Option<&[NotificationId]>,
    ) -> ParleyResult<u64> {
        let conn = self.get_conn().await?;
        let user = user_id.as_uuid();
        let changed = match ids {
            None => conn
                .execute(
                    "UPDATE notifications SET read = TRUE WHERE user_id = $1 AND NOT read",
                    &[&user],
                )
                .await
                .map_err(db_err)?,
            Some(ids) => {
                let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
                conn.execute(
                    "UPDATE notifications SET read = TRUE
                     WHERE user_id = $1 AND NOT read AND id = ANY($2)",
                    &[&user, &ids],
                )
                .await
                .map_err(db_err)?
            }
        };
        Ok(changed)
    }

    async fn ping(&self) -> ParleyResult<()> {
        let conn = self.get_conn().await?;
        conn.simple_query("SELECT 1").await.map_err(db_err)?;
        Ok(())
    }
}
