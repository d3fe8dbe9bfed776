//! Property-based tests for eviction and quota handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use murmur_store::keys::{
    AUTH_KEY, COMMUNITY_MESSAGES_KEY, COUNTERS_KEY, POSTS_KEY, SUPPORT_CONVERSATIONS_KEY,
};
use murmur_store::{DurableStore, EvictionTier, KeyValueBackend, MemoryBackend};

fn records_json(prefix: &str, count: usize) -> String {
    let records: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "id": format!("{prefix}{i}"),
                "created_at": format!("2024-03-01T{:02}:{:02}:00Z", (i / 60) % 24, i % 60),
                "content": "lorem ipsum dolor sit amet",
            })
        })
        .collect();
    serde_json::to_string(&records).unwrap()
}

fn snapshot(store: &DurableStore) -> BTreeMap<String, String> {
    store
        .keys()
        .into_iter()
        .filter_map(|k| store.read(&k).map(|v| (k, v)))
        .collect()
}

// Strategy for a store populated with a mix of entry kinds
fn populated_store() -> impl Strategy<Value = DurableStore> {
    (
        proptest::bool::ANY,
        0usize..260,
        0usize..260,
        0usize..4,
        proptest::bool::ANY,
    )
        .prop_map(|(with_auth, posts, messages, drafts, with_counters)| {
            let store = DurableStore::in_memory();
            if with_auth {
                store.write(AUTH_KEY, r#"{"identity":{"id":"u1","name":"Ada"}}"#);
            }
            if posts > 0 {
                store.write(POSTS_KEY, &records_json("p", posts));
            }
            if messages > 0 {
                store.write(COMMUNITY_MESSAGES_KEY, &records_json("m", messages));
            }
            for i in 0..drafts {
                store.write(&format!("draft_{i}"), "unsent text");
            }
            if with_counters {
                store.write(COUNTERS_KEY, r#"{"points":42}"#);
            }
            store
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn eviction_shrinks_or_is_noop(store in populated_store()) {
        let before = snapshot(&store);
        let report = store.evict();
        let after = snapshot(&store);

        prop_assert!(
            report.bytes_after < report.bytes_before || before == after,
            "eviction neither shrank the store nor left it untouched: {:?}",
            report
        );
        prop_assert_eq!(report.bytes_after, store.total_size());
    }

    #[test]
    fn eviction_never_drops_auth(store in populated_store()) {
        let auth_before = store.read(AUTH_KEY);
        let report = store.evict();

        // Last resort clears it too, but restores it from the allow-list
        prop_assert_eq!(store.read(AUTH_KEY), auth_before, "tier {:?}", report.tier);
    }

    #[test]
    fn truncated_collections_respect_limits(posts in 101usize..300, messages in 201usize..400) {
        let store = DurableStore::in_memory();
        store.write(POSTS_KEY, &records_json("p", posts));
        store.write(SUPPORT_CONVERSATIONS_KEY, &records_json("s", messages));

        let report = store.evict();
        prop_assert_eq!(report.tier, EvictionTier::Truncated);

        let kept_posts: Vec<serde_json::Value> = store.read_json(POSTS_KEY).unwrap();
        let kept_support: Vec<serde_json::Value> =
            store.read_json(SUPPORT_CONVERSATIONS_KEY).unwrap();
        prop_assert_eq!(kept_posts.len(), 100);
        prop_assert_eq!(kept_support.len(), 200);

        // Newest record survives
        let newest = format!("p{}", posts - 1);
        prop_assert_eq!(kept_posts.last().unwrap()["id"].as_str(), Some(newest.as_str()));
    }
}

#[test]
fn repeated_writes_under_quota_keep_newest() {
    let backend = Arc::new(MemoryBackend::with_quota(4_000));
    let store = DurableStore::new(backend.clone());
    store.write(AUTH_KEY, r#"{"identity":{"id":"u1"}}"#);

    let mut items: Vec<serde_json::Value> = Vec::new();
    let mut last_outcome = None;
    for i in 0..120 {
        items.push(json!({
            "id": format!("m{i}"),
            "created_at": format!("2024-03-01T00:{:02}:{:02}Z", i / 60, i % 60),
            "content": "hello there",
        }));
        last_outcome = Some(store.write_tiered(COMMUNITY_MESSAGES_KEY, &items, 20));
    }

    assert!(!last_outcome.unwrap().is_failed());
    assert!(backend.used_bytes().unwrap() <= 4_000);
    assert!(store.read(AUTH_KEY).is_some());

    let stored: Vec<serde_json::Value> = store.read_json(COMMUNITY_MESSAGES_KEY).unwrap();
    assert_eq!(stored.last().unwrap()["id"], "m119");
}
