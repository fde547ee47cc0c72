use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parley_core::{ParleyConfig, PresenceRecord, Timestamp, UserId};
use parley_storage::{KeyValueStore, Pipeline, PipelineReply};
use tracing::{debug, warn};

const ONLINE_MARKER: &str = "1";

pub fn online_key(user_id: UserId) -> String {
    format!("presence:online:{user_id}")
}

pub fn last_seen_key(user_id: UserId) -> String {
    format!("presence:last_seen:{user_id}")
}

/// Tracks who is online over a [`KeyValueStore`].
///
/// Writes never fail the caller: a key-value store error is logged and the
/// update dropped. Reads degrade to offline with an unknown last-seen time.
pub struct PresenceTracker<K: KeyValueStore> {
    kv: Arc<K>,
    ttl: Duration,
}

impl<K: KeyValueStore> Clone for PresenceTracker<K> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            ttl: self.ttl,
        }
    }
}

impl<K: KeyValueStore> PresenceTracker<K> {
    pub fn new(kv: Arc<K>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn from_config(kv: Arc<K>, config: &ParleyConfig) -> Self {
        Self::new(kv, config.presence_ttl)
    }

    /// Lifetime of the online marker without a heartbeat.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mark a user online for one TTL and clear their last-seen time.
    pub async fn set_online(&self, user_id: UserId) {
        let pipeline = Pipeline::new()
            .atomic()
            .set(online_key(user_id), ONLINE_MARKER, Some(self.ttl))
            .del(last_seen_key(user_id));

        match self.kv.exec(pipeline).await {
            Ok(_) => debug!(user_id = %user_id, "User online"),
            Err(e) => warn!(error = %e, user_id = %user_id, "Dropped presence update (online)"),
        }
    }

    /// Remove the online marker and record now as the last-seen time.
    pub async fn set_offline(&self, user_id: UserId) {
        let now = Utc::now().timestamp_millis();
        let pipeline = Pipeline::new()
            .atomic()
            .del(online_key(user_id))
            .set(last_seen_key(user_id), now.to_string(), None);

        match self.kv.exec(pipeline).await {
            Ok(_) => debug!(user_id = %user_id, last_seen_ms = now, "User offline"),
            Err(e) => warn!(error = %e, user_id = %user_id, "Dropped presence update (offline)"),
        }
    }

    /// Restart the online marker's TTL.
    ///
    /// Returns `false` when there was no live marker to refresh; an expired
    /// user has to come back through [`set_online`](Self::set_online).
    pub async fn heartbeat(&self, user_id: UserId) -> bool {
        match self.kv.expire(&online_key(user_id), self.ttl).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(error = %e, user_id = %user_id, "Dropped presence heartbeat");
                false
            }
        }
    }

    pub async fn get_presence(&self, user_id: UserId) -> PresenceRecord {
        let pipeline = Pipeline::new()
            .get(online_key(user_id))
            .get(last_seen_key(user_id));

        match self.fetch_values(pipeline, 2).await {
            Some(values) => {
                let mut values = values.into_iter();
                let online = values.next().flatten();
                let last_seen = values.next().flatten();
                record(user_id, online.as_deref(), last_seen.as_deref())
            }
            None => PresenceRecord::offline(user_id, None),
        }
    }

    /// The subset of `user_ids` currently online, in one round trip.
    pub async fn get_online_users(&self, user_ids: &[UserId]) -> HashSet<UserId> {
        let users = dedup(user_ids);
        if users.is_empty() {
            return HashSet::new();
        }

        let pipeline = users
            .iter()
            .fold(Pipeline::new(), |p, user_id| p.exists(online_key(*user_id)));

        match self.kv.exec(pipeline).await {
            Ok(replies) if replies.len() == users.len() => users
                .into_iter()
                .zip(replies)
                .filter(|(_, reply)| reply.as_flag())
                .map(|(user_id, _)| user_id)
                .collect(),
            Ok(replies) => {
                warn!(
                    expected = users.len(),
                    got = replies.len(),
                    "Presence lookup returned a short reply, reporting everyone offline"
                );
                HashSet::new()
            }
            Err(e) => {
                warn!(error = %e, users = users.len(), "Presence lookup failed, reporting everyone offline");
                HashSet::new()
            }
        }
    }

    /// Full presence records for `user_ids`, in one round trip covering both
    /// keys of every user.
    pub async fn get_bulk_presence(&self, user_ids: &[UserId]) -> HashMap<UserId, PresenceRecord> {
        let users = dedup(user_ids);
        if users.is_empty() {
            return HashMap::new();
        }

        let pipeline = users.iter().fold(Pipeline::new(), |p, user_id| {
            p.get(online_key(*user_id)).get(last_seen_key(*user_id))
        });

        match self.fetch_values(pipeline, users.len() * 2).await {
            Some(values) => users
                .into_iter()
                .zip(values.chunks(2))
                .map(|(user_id, pair)| {
                    let rec = record(user_id, pair[0].as_deref(), pair[1].as_deref());
                    (user_id, rec)
                })
                .collect(),
            None => users
                .into_iter()
                .map(|user_id| (user_id, PresenceRecord::offline(user_id, None)))
                .collect(),
        }
    }

    async fn fetch_values(&self, pipeline: Pipeline, expected: usize) -> Option<Vec<Option<String>>> {
        match self.kv.exec(pipeline).await {
            Ok(replies) if replies.len() == expected => {
                Some(replies.into_iter().map(PipelineReply::into_value).collect())
            }
            Ok(replies) => {
                warn!(expected, got = replies.len(), "Presence read returned a short reply, reporting offline");
                None
            }
            Err(e) => {
                warn!(error = %e, "Presence read failed, reporting offline");
                None
            }
        }
    }
}

fn dedup(user_ids: &[UserId]) -> Vec<UserId> {
    let mut seen = HashSet::with_capacity(user_ids.len());
    user_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}

fn record(user_id: UserId, online: Option<&str>, last_seen: Option<&str>) -> PresenceRecord {
    if online.is_some() {
        return PresenceRecord::online(user_id);
    }
    PresenceRecord::offline(user_id, last_seen.and_then(|raw| parse_last_seen(user_id, raw)))
}

fn parse_last_seen(user_id: UserId, raw: &str) -> Option<Timestamp> {
    let parsed = raw
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    if parsed.is_none() {
        warn!(user_id = %user_id, value = %raw, "Ignoring malformed last-seen value");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{EntityIdType, PresenceState};
    use parley_storage::InMemoryKvStore;
    use parley_test_utils::UnreachableKvStore;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(300);

    fn tracker() -> (Arc<InMemoryKvStore>, PresenceTracker<InMemoryKvStore>) {
        let kv = Arc::new(InMemoryKvStore::new());
        (kv.clone(), PresenceTracker::new(kv, TTL))
    }

    #[tokio::test]
    async fn test_set_online_is_idempotent() {
        let (kv, presence) = tracker();
        let user = UserId::now_v7();

        presence.set_online(user).await;
        let once = presence.get_presence(user).await;
        presence.set_online(user).await;
        let twice = presence.get_presence(user).await;

        assert_eq!(once, twice);
        assert_eq!(once, PresenceRecord::online(user));
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_does_not_fabricate_last_seen() {
        let (_, presence) = tracker();
        let user = UserId::now_v7();

        presence.set_online(user).await;
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(presence.get_presence(user).await.is_online());

        tokio::time::advance(Duration::from_secs(2)).await;
        let record = presence.get_presence(user).await;
        assert_eq!(record.state, PresenceState::Offline);
        assert_eq!(record.last_seen_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_but_never_revives() {
        let (_, presence) = tracker();
        let user = UserId::now_v7();

        presence.set_online(user).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(presence.heartbeat(user).await);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(presence.get_presence(user).await.is_online());

        tokio::time::advance(TTL).await;
        assert!(!presence.heartbeat(user).await);
        assert!(!presence.get_presence(user).await.is_online());
    }

    #[tokio::test]
    async fn test_offline_records_last_seen_and_online_clears_it() {
        let (_, presence) = tracker();
        let user = UserId::now_v7();

        presence.set_online(user).await;
        let before = Utc::now().timestamp_millis();
        presence.set_offline(user).await;
        let after = Utc::now().timestamp_millis();

        let record = presence.get_presence(user).await;
        assert!(!record.is_online());
        let seen = record.last_seen_at.unwrap().timestamp_millis();
        assert!((before..=after).contains(&seen));

        presence.set_online(user).await;
        let record = presence.get_presence(user).await;
        assert!(record.is_online());
        assert_eq!(record.last_seen_at, None);
    }

    #[tokio::test]
    async fn test_duplicate_offline_advances_last_seen() {
        let (_, presence) = tracker();
        let user = UserId::now_v7();

        presence.set_offline(user).await;
        let first = presence.get_presence(user).await.last_seen_at.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        presence.set_offline(user).await;
        let second = presence.get_presence(user).await.last_seen_at.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_bulk_reads_are_one_round_trip() {
        let (kv, presence) = tracker();
        let users: Vec<UserId> = (0..25).map(|_| UserId::now_v7()).collect();
        for user in users.iter().step_by(2) {
            presence.set_online(*user).await;
        }

        let before = kv.round_trips();
        let online = presence.get_online_users(&users).await;
        assert_eq!(kv.round_trips() - before, 1);
        assert_eq!(online.len(), 13);

        let before = kv.round_trips();
        let bulk = presence.get_bulk_presence(&users).await;
        assert_eq!(kv.round_trips() - before, 1);
        assert_eq!(bulk.len(), 25);
        assert!(users.iter().all(|u| bulk[u].is_online() == online.contains(u)));
    }

    #[tokio::test]
    async fn test_empty_bulk_input_skips_store() {
        let (kv, presence) = tracker();
        assert!(presence.get_online_users(&[]).await.is_empty());
        assert!(presence.get_bulk_presence(&[]).await.is_empty());
        assert_eq!(kv.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_malformed_last_seen_is_unknown() {
        let (kv, presence) = tracker();
        let user = UserId::now_v7();
        kv.set(&last_seen_key(user), "yesterday", None).await.unwrap();
        assert_eq!(presence.get_presence(user).await, PresenceRecord::offline(user, None));
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_offline() {
        let presence = PresenceTracker::new(Arc::new(UnreachableKvStore::new()), TTL);
        let user = UserId::now_v7();

        presence.set_online(user).await;
        assert!(!presence.heartbeat(user).await);
        presence.set_offline(user).await;

        assert_eq!(presence.get_presence(user).await, PresenceRecord::offline(user, None));
        assert!(presence.get_online_users(&[user]).await.is_empty());
        let bulk = presence.get_bulk_presence(&[user]).await;
        assert_eq!(bulk[&user], PresenceRecord::offline(user, None));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Bulk presence agrees with per-user reads for any mix of states.
        #[test]
        fn prop_bulk_matches_single_reads(states in proptest::collection::vec(0u8..3, 0..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let (_, presence) = tracker();
                let mut users = Vec::new();
                for state in &states {
                    let user = UserId::now_v7();
                    match state {
                        0 => presence.set_online(user).await,
                        1 => presence.set_offline(user).await,
                        _ => {}
                    }
                    users.push(user);
                }

                let bulk = presence.get_bulk_presence(&users).await;
                let online = presence.get_online_users(&users).await;
                for user in &users {
                    let single = presence.get_presence(*user).await;
                    prop_assert_eq!(bulk[user], single);
                    prop_assert_eq!(online.contains(user), single.is_online());
                }
                Ok(())
            })?;
        }
    }
}
