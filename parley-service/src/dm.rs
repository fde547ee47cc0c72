//! Direct-Message Key Resolution
//!
//! Every two-party chat carries a canonical key built from its participants,
//! so a pair of users maps to exactly one chat no matter who starts the
//! conversation. The store's uniqueness rule on that key is the arbiter when
//! two callers race to create the same chat; the loser re-reads the winner's
//! row.

use chrono::Utc;
use parley_core::{
    ChatDetail, ChatId, ChatIdentity, ConfigError, DmKey, EntityIdType, ParleyConfig,
    ParleyError, ParleyResult, UserId,
};
use parley_storage::{DirectChatStore, NewChat};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`DmKeyResolver::get_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmResolution {
    pub chat: ChatDetail,
    /// Whether this call inserted the chat.
    pub created: bool,
}

/// Paging and write mode for [`DmKeyResolver::backfill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillOptions {
    pub batch_size: u32,
    /// Compute the report without writing any key.
    pub dry_run: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            dry_run: false,
        }
    }
}

/// Counters produced by a backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Direct chats without a key that were examined.
    pub scanned: u64,
    /// Keys written (or, on a dry run, that would have been written).
    pub updated: u64,
    /// Chats left untouched because they do not have exactly two participants.
    pub skipped: u64,
    /// Chats whose pair already has a keyed chat.
    pub conflicts: u64,
    pub dry_run: bool,
}

/// Resolves the unique direct chat between two users.
pub struct DmKeyResolver<S: ?Sized> {
    store: Arc<S>,
    max_attempts: u32,
}

impl<S: ?Sized> Clone for DmKeyResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            max_attempts: self.max_attempts,
        }
    }
}

impl<S: DirectChatStore + ?Sized> DmKeyResolver<S> {
    pub fn new(store: Arc<S>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(store: Arc<S>, config: &ParleyConfig) -> Self {
        Self::new(store, config.dm_create_attempts)
    }

    /// `smaller_larger` key of an unordered pair. Rejects `a == b`.
    pub fn canonical_key(a: UserId, b: UserId) -> ParleyResult<DmKey> {
        Ok(DmKey::for_pair(a, b)?)
    }

    /// The existing direct chat between `a` and `b`, if any.
    pub async fn find(&self, a: UserId, b: UserId) -> ParleyResult<Option<ChatDetail>> {
        let key = Self::canonical_key(a, b)?;
        self.store.find_direct_chat(&key).await
    }

    /// Return the direct chat between `a` and `b`, creating it if needed.
    ///
    /// Concurrent callers for the same pair all observe the same chat: a
    /// uniqueness violation on insert means another caller won, and its row
    /// is fetched instead.
    pub async fn get_or_create(&self, a: UserId, b: UserId) -> ParleyResult<DmResolution> {
        let key = Self::canonical_key(a, b)?;

        for attempt in 1..=self.max_attempts {
            if let Some(chat) = self.store.find_direct_chat(&key).await? {
                return Ok(DmResolution {
                    chat,
                    created: false,
                });
            }

            let identity = ChatIdentity::direct(ChatId::now_v7(), a, b)?;
            match self
                .store
                .create_direct_chat(NewChat::direct(&identity, Utc::now()))
                .await
            {
                Ok(chat) => {
                    info!(chat_id = %chat.chat_id, dm_key = %key, "Direct chat created");
                    return Ok(DmResolution {
                        chat,
                        created: true,
                    });
                }
                Err(e) if e.is_unique_violation() => {
                    debug!(dm_key = %key, attempt, "Lost direct chat creation race, re-fetching");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(chat) = self.store.find_direct_chat(&key).await? {
            return Ok(DmResolution {
                chat,
                created: false,
            });
        }

        warn!(dm_key = %key, attempts = self.max_attempts, "Direct chat still conflicting");
        Err(ParleyError::Conflict {
            reason: format!(
                "direct chat {} could not be resolved after {} attempts",
                key, self.max_attempts
            ),
        })
    }

    /// Write canonical keys onto direct chats that predate them.
    ///
    /// Chats without exactly two participants are skipped and counted. A
    /// chat whose pair already has a keyed chat is counted as a conflict and
    /// left for manual merge.
    pub async fn backfill(&self, options: BackfillOptions) -> ParleyResult<BackfillReport> {
        if options.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        let mut report = BackfillReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let mut after: Option<ChatId> = None;

        loop {
            let batch = self
                .store
                .dm_backfill_candidates(after, options.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.chat_id);

            for chat in &batch {
                report.scanned += 1;
                let key = match chat.expected_dm_key() {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(
                            chat_id = %chat.chat_id,
                            participants = chat.participant_ids.len(),
                            reason = %e,
                            "Skipping direct chat without exactly two participants"
                        );
                        report.skipped += 1;
                        continue;
                    }
                };

                if options.dry_run {
                    report.updated += 1;
                    continue;
                }

                match self.store.set_dm_key(chat.chat_id, &key).await {
                    Ok(()) => report.updated += 1,
                    Err(e) if e.is_unique_violation() => {
                        warn!(
                            chat_id = %chat.chat_id,
                            dm_key = %key,
                            "Pair already has a keyed direct chat, leaving row unkeyed"
                        );
                        report.conflicts += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if (batch.len() as u64) < u64::from(options.batch_size) {
                break;
            }
        }

        info!(
            scanned = report.scanned,
            updated = report.updated,
            skipped = report.skipped,
            conflicts = report.conflicts,
            dry_run = report.dry_run,
            "DM key backfill finished"
        );
        Ok(report)
    }
}
