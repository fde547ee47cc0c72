//! Keyset (cursor) pagination policy.
//!
//! Feeds are strictly ordered by `(created_at, id)`. A cursor names the last
//! item a client has seen; the next page holds the items strictly after it in
//! feed order. The relational store executes the same policy in SQL, and
//! [`paginate`]/[`window`] execute it over an in-memory snapshot.

use crate::{EntityIdType, StorageError, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Opaque pointer at the last item seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Uuid);

impl Cursor {
    pub fn from_id<I: EntityIdType>(id: I) -> Self {
        Self(id.as_uuid())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Items that live in an ordered feed.
pub trait Keyset {
    /// `(created_at, id)`; the id breaks ties between equal timestamps.
    fn keyset(&self) -> (Timestamp, Uuid);
}

/// Direction a feed is served in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedOrder {
    /// Most recent first. Chat history and notifications are served this way.
    #[default]
    NewestFirst,
    OldestFirst,
}

impl FeedOrder {
    /// Compare two keys in feed order.
    pub fn compare(&self, a: &(Timestamp, Uuid), b: &(Timestamp, Uuid)) -> Ordering {
        match self {
            Self::OldestFirst => a.cmp(b),
            Self::NewestFirst => b.cmp(a),
        }
    }
}

/// Default and hard-cap page sizes for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl PageLimits {
    pub const fn new(default_limit: u32, max_limit: u32) -> Self {
        Self {
            default_limit,
            max_limit,
        }
    }

    /// Resolve a requested page size: missing means default, and the result
    /// always lies in `1..=max_limit`.
    pub fn clamp(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

/// A request for one page of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<Cursor>,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(cursor: Option<Cursor>, requested_limit: Option<u32>, limits: &PageLimits) -> Self {
        Self {
            cursor,
            limit: limits.clamp(requested_limit),
        }
    }

    /// The first page with the feed's default size.
    pub fn head(limits: &PageLimits) -> Self {
        Self::new(None, None, limits)
    }

    /// Whether this is the default first page (the only page shape that is cached).
    pub fn is_head_of(&self, limits: &PageLimits) -> bool {
        self.cursor.is_none() && self.limit == limits.clamp(None)
    }
}

/// One page of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Id of the last returned item, or `None` when the page came back short.
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

impl<T: Keyset> Page<T> {
    /// Wrap at most `limit` items already in feed order.
    pub fn from_items(mut items: Vec<T>, limit: u32) -> Self {
        items.truncate(limit as usize);
        let next_cursor = if limit > 0 && items.len() == limit as usize {
            items.last().map(|item| Cursor::from_uuid(item.keyset().1))
        } else {
            None
        };
        Self {
            has_more: next_cursor.is_some(),
            items,
            next_cursor,
        }
    }
}

/// A request for items on both sides of an anchor item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRequest {
    pub anchor: Cursor,
    pub limit_before: u32,
    pub limit_after: u32,
}

impl WindowRequest {
    /// Each side is capped at the feed's maximum page size; zero is allowed.
    pub fn new(
        anchor: Cursor,
        limit_before: Option<u32>,
        limit_after: Option<u32>,
        limits: &PageLimits,
    ) -> Self {
        let side = |requested: Option<u32>| {
            requested
                .unwrap_or(limits.default_limit / 2)
                .min(limits.max_limit)
        };
        Self {
            anchor,
            limit_before: side(limit_before),
            limit_after: side(limit_after),
        }
    }
}

/// Items around an anchor, both sides in chronological order so that
/// `before ++ [anchor] ++ after` renders as one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window<T> {
    pub anchor_id: Cursor,
    pub anchor: T,
    pub before: Vec<T>,
    pub after: Vec<T>,
    /// Oldest item of `before` when more older items may exist.
    pub before_cursor: Option<Cursor>,
    /// Newest item of `after` when more newer items may exist.
    pub after_cursor: Option<Cursor>,
    pub has_more_before: bool,
    pub has_more_after: bool,
}

impl<T: Keyset> Window<T> {
    /// Build a window from its parts. `before` and `after` must already be
    /// chronological and hold at most their side's limit.
    pub fn assemble(anchor: T, before: Vec<T>, after: Vec<T>, request: &WindowRequest) -> Self {
        let has_more_before =
            request.limit_before > 0 && before.len() == request.limit_before as usize;
        let has_more_after = request.limit_after > 0 && after.len() == request.limit_after as usize;

        Self {
            anchor_id: request.anchor,
            anchor,
            before_cursor: has_more_before
                .then(|| before.first().map(|i| Cursor::from_uuid(i.keyset().1)))
                .flatten(),
            after_cursor: has_more_after
                .then(|| after.last().map(|i| Cursor::from_uuid(i.keyset().1)))
                .flatten(),
            before,
            after,
            has_more_before,
            has_more_after,
        }
    }
}

fn locate<T: Keyset>(feed: &[T], cursor: Cursor) -> Result<(Timestamp, Uuid), StorageError> {
    feed.iter()
        .map(Keyset::keyset)
        .find(|(_, id)| *id == cursor.as_uuid())
        .ok_or_else(|| StorageError::InvalidCursor {
            cursor: cursor.to_string(),
        })
}

/// Serve one page of `feed` in `order`.
///
/// A cursor that does not name an item of the feed is an error; otherwise
/// exactly the items strictly after the cursor item are eligible.
pub fn paginate<T: Keyset + Clone>(
    feed: &[T],
    order: FeedOrder,
    request: &PageRequest,
) -> Result<Page<T>, StorageError> {
    let boundary = request.cursor.map(|c| locate(feed, c)).transpose()?;

    let mut eligible: Vec<&T> = feed
        .iter()
        .filter(|item| match &boundary {
            Some(key) => order.compare(&item.keyset(), key) == Ordering::Greater,
            None => true,
        })
        .collect();
    eligible.sort_by(|a, b| order.compare(&a.keyset(), &b.keyset()));

    let items = eligible
        .into_iter()
        .take(request.limit as usize)
        .cloned()
        .collect();
    Ok(Page::from_items(items, request.limit))
}

/// Serve the items around an anchor.
pub fn window<T: Keyset + Clone>(
    feed: &[T],
    request: &WindowRequest,
) -> Result<Window<T>, StorageError> {
    let anchor_key = locate(feed, request.anchor)?;

    let mut sorted: Vec<&T> = feed.iter().collect();
    sorted.sort_by_key(|item| item.keyset());

    let pos = sorted
        .iter()
        .position(|item| item.keyset() == anchor_key)
        .ok_or_else(|| StorageError::InvalidCursor {
            cursor: request.anchor.to_string(),
        })?;

    let older = &sorted[..pos];
    let newer = &sorted[pos + 1..];

    let take_before = (request.limit_before as usize).min(older.len());
    let before: Vec<T> = older[older.len() - take_before..]
        .iter()
        .map(|item| (*item).clone())
        .collect();
    let after: Vec<T> = newer
        .iter()
        .take(request.limit_after as usize)
        .map(|item| (*item).clone())
        .collect();

    Ok(Window::assemble(sorted[pos].clone(), before, after, request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: Uuid,
        at: Timestamp,
    }

    impl Keyset for Item {
        fn keyset(&self) -> (Timestamp, Uuid) {
            (self.at, self.id)
        }
    }

    fn feed(n: usize) -> Vec<Item> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Item {
                id: Uuid::from_u128(i as u128 + 1),
                // pairs of items share a timestamp to exercise the tie-breaker
                at: base + Duration::seconds((i / 2) as i64),
            })
            .collect()
    }

    fn drain(feed: &[Item], order: FeedOrder, limit: u32) -> (Vec<Item>, Vec<usize>) {
        let mut out = Vec::new();
        let mut sizes = Vec::new();
        let mut request = PageRequest { cursor: None, limit };
        loop {
            let page = paginate(feed, order, &request).unwrap();
            sizes.push(page.items.len());
            out.extend(page.items);
            match page.next_cursor {
                Some(cursor) if page.has_more => request.cursor = Some(cursor),
                _ => break,
            }
        }
        (out, sizes)
    }

    #[test]
    fn test_limits_clamp() {
        let limits = PageLimits::new(50, 100);
        assert_eq!(limits.clamp(None), 50);
        assert_eq!(limits.clamp(Some(0)), 1);
        assert_eq!(limits.clamp(Some(500)), 100);
        assert_eq!(limits.clamp(Some(7)), 7);
    }

    #[test]
    fn test_head_detection() {
        let limits = PageLimits::new(20, 50);
        assert!(PageRequest::head(&limits).is_head_of(&limits));
        assert!(!PageRequest::new(None, Some(5), &limits).is_head_of(&limits));
        let cursor = Cursor::from_uuid(Uuid::nil());
        assert!(!PageRequest::new(Some(cursor), None, &limits).is_head_of(&limits));
    }

    #[test]
    fn test_47_items_by_20_yields_20_20_7() {
        let items = feed(47);
        let (out, sizes) = drain(&items, FeedOrder::NewestFirst, 20);
        assert_eq!(sizes, vec![20, 20, 7]);
        assert_eq!(out.len(), 47);

        let mut expected = items.clone();
        expected.sort_by(|a, b| b.keyset().cmp(&a.keyset()));
        assert_eq!(out, expected);
    }

    #[test]
    fn test_short_page_has_no_cursor() {
        let items = feed(3);
        let page = paginate(&items, FeedOrder::OldestFirst, &PageRequest { cursor: None, limit: 5 }).unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.next_cursor.is_none());
        assert!(!page.has_more);
    }

    #[test]
    fn test_cursor_row_is_skipped_exactly_once() {
        let items = feed(6);
        let first = paginate(&items, FeedOrder::OldestFirst, &PageRequest { cursor: None, limit: 3 }).unwrap();
        let cursor = first.next_cursor.unwrap();
        assert_eq!(cursor.as_uuid(), first.items[2].id);

        let second = paginate(
            &items,
            FeedOrder::OldestFirst,
            &PageRequest { cursor: Some(cursor), limit: 3 },
        )
        .unwrap();
        assert_eq!(second.items.first().unwrap().id, items[3].id);
        assert!(second.items.iter().all(|i| i.id != cursor.as_uuid()));
    }

    #[test]
    fn test_unknown_cursor_is_rejected() {
        let items = feed(4);
        let stray = Cursor::from_uuid(Uuid::from_u128(999));
        let result = paginate(
            &items,
            FeedOrder::NewestFirst,
            &PageRequest { cursor: Some(stray), limit: 2 },
        );
        assert!(matches!(result, Err(StorageError::InvalidCursor { .. })));
    }

    #[test]
    fn test_new_inserts_do_not_shift_later_pages() {
        let mut items = feed(10);
        let first = paginate(&items, FeedOrder::NewestFirst, &PageRequest { cursor: None, limit: 4 }).unwrap();

        // a newer item arrives between page fetches
        items.push(Item {
            id: Uuid::from_u128(1000),
            at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        });

        let second = paginate(
            &items,
            FeedOrder::NewestFirst,
            &PageRequest { cursor: first.next_cursor, limit: 4 },
        )
        .unwrap();
        let seen: Vec<_> = first.items.iter().map(|i| i.id).collect();
        assert!(second.items.iter().all(|i| !seen.contains(&i.id)));
        assert_eq!(second.items.len(), 4);
    }

    #[test]
    fn test_window_around_anchor() {
        let items = feed(11);
        let anchor = items[5].clone();
        let w = window(
            &items,
            &WindowRequest {
                anchor: Cursor::from_uuid(anchor.id),
                limit_before: 3,
                limit_after: 10,
            },
        )
        .unwrap();

        assert_eq!(w.anchor, anchor);
        assert_eq!(w.before.iter().map(|i| i.id).collect::<Vec<_>>(), vec![items[2].id, items[3].id, items[4].id]);
        assert_eq!(w.after.len(), 5);
        assert!(w.has_more_before);
        assert_eq!(w.before_cursor, Some(Cursor::from_uuid(items[2].id)));
        assert!(!w.has_more_after);
        assert!(w.after_cursor.is_none());
    }

    #[test]
    fn test_window_unknown_anchor() {
        let items = feed(3);
        let result = window(
            &items,
            &WindowRequest {
                anchor: Cursor::from_uuid(Uuid::from_u128(77)),
                limit_before: 1,
                limit_after: 1,
            },
        );
        assert!(matches!(result, Err(StorageError::InvalidCursor { .. })));
    }

    #[test]
    fn test_window_request_caps_each_side() {
        let limits = PageLimits::new(50, 100);
        let anchor = Cursor::from_uuid(Uuid::nil());
        let req = WindowRequest::new(anchor, Some(400), None, &limits);
        assert_eq!(req.limit_before, 100);
        assert_eq!(req.limit_after, 25);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Walking a feed by cursor reproduces it with no gap and no duplicate.
        #[test]
        fn prop_pages_concatenate_to_feed(n in 0usize..120, limit in 1u32..40, newest_first in any::<bool>()) {
            let items = feed(n);
            let order = if newest_first { FeedOrder::NewestFirst } else { FeedOrder::OldestFirst };
            let (out, sizes) = drain(&items, order, limit);

            let mut expected = items.clone();
            expected.sort_by(|a, b| order.compare(&a.keyset(), &b.keyset()));
            prop_assert_eq!(out, expected);
            prop_assert!(sizes.iter().all(|s| *s <= limit as usize));
        }
    }
}
