//! Parley Presence - Online/Offline Tracking
//!
//! Presence lives in the shared key-value store as two keys per user:
//!
//! - `presence:online:{user}`: value `1`, expires after the presence TTL
//!   unless refreshed by a heartbeat.
//! - `presence:last_seen:{user}`: epoch milliseconds of the last explicit
//!   disconnect, no TTL.
//!
//! A user whose marker silently expired is offline with an unknown last-seen
//! time; only [`PresenceTracker::set_offline`] records one.

mod tracker;

pub use tracker::{last_seen_key, online_key, PresenceTracker};
