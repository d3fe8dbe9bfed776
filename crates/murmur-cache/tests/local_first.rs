//! Local-first behavior: storage pressure, profile edits, the support desk,
//! delete policies and persistence across restarts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use test_case::test_case;
use tokio::sync::watch;

use murmur_cache::{
    AuthorSnapshot, CacheError, CacheEvent, Caches, CollectionKey, DeletePolicy, EventBus,
    NoticeKind, ProfileUpdate, Record, RecordDraft, Role, SyncConfig, spawn_profile_watcher,
};
use murmur_remote::RemoteBackend;
use murmur_store::keys::{
    AUTH_KEY, COMMENTS_KEY, COMMUNITY_MESSAGES_KEY, POSTS_KEY, SUPPORT_CONVERSATIONS_KEY,
};
use murmur_store::{DurableStore, FileBackend, KeyValueBackend, MemoryBackend};

use common::{Harness, ada, contents, drain_notices, harness, remote_author, test_config};

fn caches_over(backend: Arc<dyn KeyValueBackend>) -> Caches {
    let caches = Caches::new(
        Arc::new(DurableStore::new(backend)),
        EventBus::new(),
        SyncConfig::default(),
    );
    caches.session.set(ada());
    caches
}

fn support_agent() -> AuthorSnapshot {
    AuthorSnapshot::new("s1", "Sam", Role::Support)
}

// =============================================================================
// Storage pressure
// =============================================================================

#[test]
fn test_full_storage_keeps_records_in_memory() {
    let backend = Arc::new(MemoryBackend::new());
    let caches = caches_over(backend.clone());
    backend.set_quota(Some(caches.store.total_size() + 50));
    let mut events = caches.bus.subscribe();

    let record = caches
        .posts
        .create(RecordDraft::text("this post will never fit in the store ".repeat(8)))
        .unwrap();

    assert_eq!(caches.posts.list(), vec![record]);
    let notices = drain_notices(&mut events);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::StorageFull);
    assert!(!notices[0].dismissible());
    assert!(caches.store.read(AUTH_KEY).is_some());
}

#[test]
fn test_growing_collection_degrades_to_recent_records() {
    let backend = Arc::new(MemoryBackend::with_quota(8_000));
    let caches = caches_over(backend.clone());
    let mut events = caches.bus.subscribe();

    let post = caches.posts.create(RecordDraft::text("a post")).unwrap();
    caches
        .comments
        .create(RecordDraft::text("a comment").with_parent(&post.id))
        .unwrap();
    caches
        .support_desk()
        .send(RecordDraft::text("need help"))
        .unwrap();

    for i in 0..60 {
        caches
            .community
            .create(RecordDraft::text(format!("message number {i} with some padding text")))
            .unwrap();
    }

    assert_eq!(caches.community.len(), 60);
    assert!(backend.used_bytes().unwrap() <= 8_000);

    // What fits on disk is the newest tail of the conversation
    let stored: Vec<Record> = caches.store.read_json(COMMUNITY_MESSAGES_KEY).unwrap();
    assert!(!stored.is_empty() && stored.len() < 60);
    let cached = caches.community.snapshot();
    let tail: Vec<String> = cached[cached.len() - stored.len()..]
        .iter()
        .map(|r| r.id.clone())
        .collect();
    let stored_ids: Vec<String> = stored.iter().map(|r| r.id.clone()).collect();
    assert_eq!(stored_ids, tail);

    // Other collections are untouched
    let comments: Vec<Record> = caches.store.read_json(COMMENTS_KEY).unwrap();
    assert_eq!(contents(&comments), vec!["a comment"]);
    let support: Vec<Record> = caches.store.read_json(SUPPORT_CONVERSATIONS_KEY).unwrap();
    assert_eq!(contents(&support), vec!["need help"]);
    assert!(caches.store.read(POSTS_KEY).is_some());
    assert!(drain_notices(&mut events).is_empty());
    assert!(caches.store.read(AUTH_KEY).is_some());
}

// =============================================================================
// Profile propagation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_profile_change_rewrites_every_collection() {
    let Harness { caches, .. } = harness(test_config());
    let post = caches.posts.create(RecordDraft::text("hello")).unwrap();
    caches
        .comments
        .create(RecordDraft::text("replying").with_parent(&post.id))
        .unwrap();
    caches.community.create(RecordDraft::text("hi all")).unwrap();
    caches
        .community
        .create(
            RecordDraft::text("hey").with_author(AuthorSnapshot::new("u2", "Bob", Role::User)),
        )
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = Arc::new(caches.propagator()).spawn_listener(&caches.bus, shutdown_rx);

    caches.bus.publish(CacheEvent::ProfileChanged(ProfileUpdate {
        identity_id: "u1".into(),
        name: Some("Ada Lovelace".into()),
        avatar: Some("https://cdn.example/ada.png".into()),
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    for cache in caches.all() {
        for record in cache.snapshot() {
            if record.author.id == "u1" {
                assert_eq!(record.author.name, "Ada Lovelace");
                assert_eq!(record.author.avatar.as_deref(), Some("https://cdn.example/ada.png"));
            } else {
                assert_eq!(record.author.name, "Bob");
            }
        }
    }
    assert_eq!(caches.session.current().unwrap().name, "Ada Lovelace");

    // The rewrite reached the store too
    let stored: Vec<Record> = caches.store.read_json(POSTS_KEY).unwrap();
    assert_eq!(stored[0].author.name, "Ada Lovelace");

    shutdown_tx.send(true).unwrap();
    listener.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remote_profile_edit_reaches_cached_records() {
    let Harness {
        caches, backend, ..
    } = harness(test_config());
    backend.set_identity(Some(remote_author("u1", "Ada", "user")));
    caches.posts.create(RecordDraft::text("hello")).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = Arc::new(caches.propagator()).spawn_listener(&caches.bus, shutdown_rx.clone());
    let remote: Arc<dyn RemoteBackend> = backend.clone();
    let watcher =
        spawn_profile_watcher(Arc::clone(&caches.session), remote, &caches.bus, shutdown_rx);
    let mut events = caches.bus.subscribe();

    // Someone else's edit leaves our records alone
    backend.put_profile(remote_author("u2", "Bob", "user"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(caches.posts.snapshot()[0].author.name, "Ada");

    backend.put_profile(remote_author("u1", "Ada Lovelace", "user"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(caches.session.current().unwrap().name, "Ada Lovelace");
    assert_eq!(caches.posts.snapshot()[0].author.name, "Ada Lovelace");
    let profile_events: Vec<ProfileUpdate> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            CacheEvent::ProfileChanged(update) => Some(update),
            _ => None,
        })
        .collect();
    assert_eq!(
        profile_events,
        vec![ProfileUpdate {
            identity_id: "u1".into(),
            name: Some("Ada Lovelace".into()),
            avatar: None,
        }]
    );

    shutdown_tx.send(true).unwrap();
    listener.await.unwrap();
    watcher.await.unwrap();
}

#[test]
fn test_propagation_report() {
    let Harness { caches, .. } = harness(test_config());
    caches.posts.create(RecordDraft::text("one")).unwrap();
    caches.posts.create(RecordDraft::text("two")).unwrap();

    let update = ProfileUpdate {
        identity_id: "u1".into(),
        name: Some("Ada L.".into()),
        avatar: None,
    };
    let report = caches.propagator().propagate(&update);
    assert_eq!(report.rewritten, vec![(CollectionKey::Posts, 2)]);
    assert_eq!(report.total(), 2);
    assert!(report.session_updated);

    // Nothing left to change
    let again = caches.propagator().propagate(&update);
    assert_eq!(again.total(), 0);
}

// =============================================================================
// Support desk
// =============================================================================

#[test]
fn test_support_conversation_lifecycle() {
    let Harness { caches, .. } = harness(test_config());
    let desk = caches.support_desk();

    // A user's first message opens their conversation, wherever it was aimed
    let first = desk
        .send(RecordDraft::text("my order is late").with_parent("someone-else"))
        .unwrap();
    assert_eq!(first.parent_id.as_deref(), Some("u1"));

    // Staff can only answer existing conversations
    assert_eq!(
        desk.send(
            RecordDraft::text("hello?")
                .with_parent("nobody")
                .with_author(support_agent())
        ),
        Err(CacheError::MissingParent {
            collection: CollectionKey::SupportMessages,
            parent_id: "nobody".into()
        })
    );
    desk.send(
        RecordDraft::text("looking into it")
            .with_parent("u1")
            .with_author(support_agent()),
    )
    .unwrap();

    let inbox = desk.conversations();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].key, "u1");
    assert_eq!(inbox[0].message_count, 2);
    assert_eq!(inbox[0].last_message, "looking into it");
    assert_eq!(inbox[0].participant.as_ref().unwrap().name, "Ada");
    assert_eq!(inbox[0].unread_count, 1);

    let opened = desk.open_as_support("u1").unwrap();
    assert_eq!(contents(&opened), vec!["my order is late", "looking into it"]);
    assert_eq!(desk.conversations()[0].unread_count, 0);

    // Read markers survive a restart
    let reopened = caches.support_desk();
    assert_eq!(reopened.conversations()[0].unread_count, 0);

    assert!(matches!(
        desk.open_as_support("ghost"),
        Err(CacheError::NotFound { .. })
    ));
}

#[test]
fn test_inbox_orders_by_latest_activity() {
    let Harness { caches, .. } = harness(test_config());
    let desk = caches.support_desk();

    desk.send(RecordDraft::text("first user")).unwrap();
    desk.send(
        RecordDraft::text("second user").with_author(AuthorSnapshot::new("u2", "Bob", Role::User)),
    )
    .unwrap();

    let keys: Vec<String> = desk.conversations().into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec!["u2", "u1"]);
    assert_eq!(desk.messages("u2").len(), 1);
}

// =============================================================================
// Delete policies against the remote
// =============================================================================

#[test_case(DeletePolicy::Cascade, 0, 0 ; "cascade removes comments remotely")]
#[test_case(DeletePolicy::Orphan, 0, 2 ; "orphan leaves comments")]
#[test_case(DeletePolicy::Reject, 1, 2 ; "reject keeps everything")]
#[tokio::test(start_paused = true)]
async fn test_delete_policy_reaches_remote(
    policy: DeletePolicy,
    remote_posts: usize,
    remote_comments: usize,
) {
    let Harness {
        caches,
        backend,
        reconciler,
    } = harness(test_config().with_delete_policy(policy));

    let post = caches.posts.create(RecordDraft::text("post")).unwrap();
    for text in ["a", "b"] {
        caches
            .comments
            .create(RecordDraft::text(text).with_parent(&post.id))
            .unwrap();
    }
    reconciler.flush_outbox().await;

    // Comments were pushed under the confirmed post id
    let confirmed = caches.posts.list().remove(0);
    assert!(!confirmed.is_local());
    assert!(
        backend
            .rows("comments")
            .iter()
            .all(|c| c.parent_id.as_deref() == Some(confirmed.id.as_str()))
    );
    assert_eq!(backend.rows("comments").len(), 2);

    let result = caches.posts.delete(&confirmed.id);
    assert_eq!(result.is_err(), policy == DeletePolicy::Reject);
    reconciler.flush_outbox().await;

    assert_eq!(backend.rows("posts").len(), remote_posts);
    assert_eq!(backend.rows("comments").len(), remote_comments);
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_records_and_session_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let post_id = {
        let caches = caches_over(Arc::new(FileBackend::open(dir.path()).unwrap()));
        let post = caches.posts.create(RecordDraft::text("persisted")).unwrap();
        caches.community.create(RecordDraft::emoji("🎉")).unwrap();
        caches.flush();
        post.id
    };

    let backend = Arc::new(FileBackend::open(dir.path()).unwrap());
    let caches = Caches::new(
        Arc::new(DurableStore::new(backend)),
        EventBus::new(),
        SyncConfig::default(),
    );
    assert_eq!(caches.load_all(), 2);
    assert_eq!(caches.posts.get(&post_id).unwrap().content, "persisted");
    assert!(caches.posts.get(&post_id).unwrap().is_local());
    assert_eq!(caches.session.current(), Some(ada()));
}
