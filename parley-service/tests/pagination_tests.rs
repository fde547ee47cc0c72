//! Keyset paging through the chat service.

use std::collections::HashSet;
use std::sync::Arc;

use parley_core::{ChatId, Cursor, EntityIdType, Message, MessageId, UserId};
use parley_service::ChatService;
use parley_storage::{
    CacheKey, ChatStore, InMemoryChatStore, InMemoryKvStore, KeyValueStore, ReadThroughCache,
};
use parley_test_utils::assertions::{assert_forbidden, assert_invalid_cursor};
use parley_test_utils::fixtures::{message_series, notification, small_page_config};

type MemService = ChatService<InMemoryKvStore, InMemoryChatStore>;

struct Seeded {
    kv: Arc<InMemoryKvStore>,
    store: Arc<InMemoryChatStore>,
    svc: MemService,
    member: UserId,
    chat_id: ChatId,
    /// Oldest first.
    messages: Vec<Message>,
}

async fn seeded(count: usize) -> Seeded {
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryChatStore::new());
    let svc = ChatService::new(
        Arc::clone(&store),
        ReadThroughCache::with_defaults(Arc::clone(&kv)),
        &small_page_config(),
    );
    let (a, b) = (UserId::now_v7(), UserId::now_v7());
    let chat_id = svc.start_direct_chat(a, b).await.unwrap().chat.chat_id;

    let messages = message_series(chat_id, a, count);
    for message in &messages {
        store.insert_message(message.clone()).await.unwrap();
    }
    Seeded {
        kv,
        store,
        svc,
        member: b,
        chat_id,
        messages,
    }
}

#[tokio::test]
async fn test_47_messages_page_as_20_20_7() {
    let s = seeded(47).await;

    let mut sizes = Vec::new();
    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = s
            .svc
            .messages(s.member, s.chat_id, cursor, None)
            .await
            .unwrap();
        sizes.push(page.messages.len());
        assert_eq!(page.meta.limit, 20);
        seen.extend(page.messages.iter().map(|m| m.message_id));
        match page.meta.next_cursor {
            Some(next) => {
                assert!(page.meta.has_more);
                cursor = Some(next);
            }
            None => {
                assert!(!page.meta.has_more);
                break;
            }
        }
    }

    assert_eq!(sizes, vec![20, 20, 7]);
    let expected: Vec<MessageId> = s.messages.iter().rev().map(|m| m.message_id).collect();
    assert_eq!(seen, expected);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 47);
}

#[tokio::test]
async fn test_limit_is_clamped_to_cap() {
    let s = seeded(130).await;
    let page = s
        .svc
        .messages(s.member, s.chat_id, None, Some(500))
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 100);
    assert_eq!(page.meta.limit, 100);

    let page = s
        .svc
        .messages(s.member, s.chat_id, None, Some(0))
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 1);
}

#[tokio::test]
async fn test_only_the_head_page_is_cached() {
    let s = seeded(30).await;
    let head_key = CacheKey::message_head(s.chat_id).render("parley");

    let head = s.svc.messages(s.member, s.chat_id, None, None).await.unwrap();
    assert!(s.kv.get(&head_key).await.unwrap().is_some());
    let stores_after_head = s.svc.cache().stats().stores;

    s.svc
        .messages(s.member, s.chat_id, head.meta.next_cursor, None)
        .await
        .unwrap();
    s.svc
        .messages(s.member, s.chat_id, None, Some(5))
        .await
        .unwrap();
    assert_eq!(s.svc.cache().stats().stores, stores_after_head);
}

#[tokio::test]
async fn test_new_message_does_not_shift_cursor_pages() {
    let s = seeded(25).await;
    let first = s.svc.messages(s.member, s.chat_id, None, None).await.unwrap();

    s.svc
        .send_message(s.member, s.chat_id, "arrives between pages")
        .await
        .unwrap();

    let second = s
        .svc
        .messages(s.member, s.chat_id, first.meta.next_cursor, None)
        .await
        .unwrap();
    assert_eq!(second.messages.len(), 5);
    let first_ids: HashSet<_> = first.messages.iter().map(|m| m.message_id).collect();
    assert!(second.messages.iter().all(|m| !first_ids.contains(&m.message_id)));
}

#[tokio::test]
async fn test_unknown_cursor_is_rejected() {
    let s = seeded(3).await;
    let stray = Cursor::from_id(MessageId::now_v7());
    assert_invalid_cursor(&s.svc.messages(s.member, s.chat_id, Some(stray), None).await);
}

#[tokio::test]
async fn test_window_around_anchor() {
    let s = seeded(15).await;
    let anchor = &s.messages[7];

    let window = s
        .svc
        .message_window(s.member, s.chat_id, anchor.message_id, Some(3), Some(20))
        .await
        .unwrap();

    assert_eq!(window.anchor.message_id, anchor.message_id);
    let before: Vec<_> = window.before.iter().map(|m| m.message_id).collect();
    let expected: Vec<_> = s.messages[4..7].iter().map(|m| m.message_id).collect();
    assert_eq!(before, expected);
    assert_eq!(window.after.len(), 7);
    assert!(window.has_more_before);
    assert!(!window.has_more_after);
}

#[tokio::test]
async fn test_window_requires_membership() {
    let s = seeded(2).await;
    let result = s
        .svc
        .message_window(UserId::now_v7(), s.chat_id, s.messages[0].message_id, None, None)
        .await;
    assert_forbidden(&result);
}

#[tokio::test]
async fn test_pinned_feed_pages_independently() {
    let s = seeded(10).await;
    for m in s.messages.iter().step_by(2) {
        s.svc
            .set_pinned(s.member, s.chat_id, m.message_id, true)
            .await
            .unwrap();
    }

    let page = s
        .svc
        .pinned_messages(s.member, s.chat_id, None, Some(3))
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 3);
    assert!(page.messages.iter().all(|m| m.pinned));
    let rest = s
        .svc
        .pinned_messages(s.member, s.chat_id, page.meta.next_cursor, Some(3))
        .await
        .unwrap();
    assert_eq!(rest.messages.len(), 2);
    assert!(rest.meta.next_cursor.is_none());
}

#[tokio::test]
async fn test_notifications_page_newest_first() {
    let s = seeded(0).await;
    let user = UserId::now_v7();
    for i in 0..25 {
        let mut n = notification(user, "mention");
        n.created_at += chrono::Duration::seconds(i);
        s.store.insert_notification(n).await.unwrap();
    }

    let first = s.svc.notifications(user, None, None).await.unwrap();
    assert_eq!(first.notifications.len(), 20);
    assert!(first
        .notifications
        .windows(2)
        .all(|w| w[0].created_at >= w[1].created_at));

    let second = s
        .svc
        .notifications(user, first.meta.next_cursor, None)
        .await
        .unwrap();
    assert_eq!(second.notifications.len(), 5);
    assert!(!second.meta.has_more);
}
