//! Cache-aside layer for chat, message and notification reads.
//!
//! Entries are JSON payloads in the shared key-value store, one per
//! [`CacheKey`]. Every hit is shape-checked by [`validator`] before it is
//! trusted; anything that fails is treated as a miss and overwritten from the
//! source of truth. Writers evict the keys derived from what they changed
//! after the change is committed.

pub mod key;
pub mod read_through;
pub mod validator;

pub use key::{CacheKey, CacheKind};
pub use read_through::{CacheConfig, CacheRead, CacheStats, ReadSource, ReadThroughCache};
