//! Shape predicates for cached payloads.
//!
//! Each predicate checks only the outer structure of a kind's payload. A
//! payload written by an older format fails here and is refetched instead of
//! breaking deserialization further down.

use serde_json::Value;

use super::key::CacheKind;

/// Whether `payload` has the minimal shape of a `kind` entry.
pub fn is_valid(kind: CacheKind, payload: &Value) -> bool {
    match kind {
        CacheKind::ChatList => is_chat_list(payload),
        CacheKind::ChatDetail => is_chat_detail(payload),
        CacheKind::MessagePage | CacheKind::PinnedPage => is_paged(payload, "messages"),
        CacheKind::NotificationPage => is_paged(payload, "notifications"),
    }
}

pub fn is_chat_list(payload: &Value) -> bool {
    payload.is_array()
}

pub fn is_chat_detail(payload: &Value) -> bool {
    payload
        .get("participants")
        .is_some_and(Value::is_array)
}

/// An object with a `meta` object and an `items_field` array.
pub fn is_paged(payload: &Value, items_field: &str) -> bool {
    payload.get("meta").is_some_and(Value::is_object)
        && payload.get(items_field).is_some_and(Value::is_array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_list_requires_array() {
        assert!(is_valid(CacheKind::ChatList, &json!([])));
        assert!(is_valid(CacheKind::ChatList, &json!([{"chat_id": "x"}])));
        assert!(!is_valid(CacheKind::ChatList, &json!({"chats": []})));
        assert!(!is_valid(CacheKind::ChatList, &Value::Null));
    }

    #[test]
    fn test_chat_detail_requires_participants_array() {
        assert!(is_valid(CacheKind::ChatDetail, &json!({"participants": []})));
        assert!(!is_valid(CacheKind::ChatDetail, &json!({"participants": {}})));
        assert!(!is_valid(CacheKind::ChatDetail, &json!({"members": []})));
        assert!(!is_valid(CacheKind::ChatDetail, &json!([])));
    }

    #[test]
    fn test_message_pages_require_meta_and_messages() {
        let good = json!({"meta": {"has_more": false}, "messages": []});
        assert!(is_valid(CacheKind::MessagePage, &good));
        assert!(is_valid(CacheKind::PinnedPage, &good));

        // legacy bare-array payload
        assert!(!is_valid(CacheKind::MessagePage, &json!([])));
        assert!(!is_valid(CacheKind::MessagePage, &json!({"messages": []})));
        assert!(!is_valid(CacheKind::PinnedPage, &json!({"meta": null, "messages": []})));
    }

    #[test]
    fn test_notification_page_requires_notifications_array() {
        assert!(is_valid(
            CacheKind::NotificationPage,
            &json!({"meta": {}, "notifications": []})
        ));
        assert!(!is_valid(
            CacheKind::NotificationPage,
            &json!({"meta": {}, "messages": []})
        ));
    }
}
