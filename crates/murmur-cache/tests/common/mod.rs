//! Shared fixtures for cache integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use murmur_cache::{
    AuthorSnapshot, CacheEvent, Caches, EventBus, Notice, Reconciler, Role, SyncConfig,
};
use murmur_remote::{MemoryBackend, NewRow, RemoteAuthor, RemoteBackend};
use murmur_store::DurableStore;
use tokio::sync::broadcast;
use uuid::Uuid;

pub struct Harness {
    pub caches: Caches,
    pub backend: Arc<MemoryBackend>,
    pub reconciler: Reconciler,
}

/// Caches over an in-memory store, reconciled against an in-memory backend,
/// signed in as Ada.
pub fn harness(config: SyncConfig) -> Harness {
    harness_with_store(Arc::new(DurableStore::in_memory()), config)
}

pub fn harness_with_store(store: Arc<DurableStore>, config: SyncConfig) -> Harness {
    let bus = EventBus::new();
    let caches = Caches::new(store, bus.clone(), config.clone());
    caches.session.set(ada());

    let backend = Arc::new(MemoryBackend::new());
    backend.put_profile(remote_author("u1", "Ada", "user"));
    let remote: Arc<dyn RemoteBackend> = backend.clone();
    let reconciler = Reconciler::new(Some(remote), bus, config);
    caches.register_with(&reconciler);

    Harness {
        caches,
        backend,
        reconciler,
    }
}

pub fn ada() -> AuthorSnapshot {
    AuthorSnapshot::new("u1", "Ada", Role::User)
}

pub fn remote_author(id: &str, name: &str, role: &str) -> RemoteAuthor {
    RemoteAuthor {
        id: id.to_string(),
        name: Some(name.to_string()),
        avatar_url: None,
        role: Some(role.to_string()),
    }
}

/// Row as another client would insert it.
pub fn foreign_row(author_id: &str, content: &str, created_at: DateTime<Utc>) -> NewRow {
    NewRow {
        client_key: Uuid::new_v4(),
        author_id: author_id.to_string(),
        created_at,
        parent_id: None,
        kind: "text".to_string(),
        content: content.to_string(),
        image_url: None,
        audio_url: None,
        audio_duration: None,
        status: "active".to_string(),
        liked_by: Vec::new(),
    }
}

/// Timings short enough to reason about with a paused clock.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        fetch_timeout: Duration::from_secs(8),
        retry_delay: Duration::from_secs(5),
        settle_delay: Duration::from_millis(300),
        polling_interval: Duration::from_secs(20),
        ..SyncConfig::default()
    }
}

/// Notices received so far.
pub fn drain_notices(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<Notice> {
    let mut notices = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CacheEvent::Notice(notice) = event {
            notices.push(notice);
        }
    }
    notices
}

pub fn contents(records: &[murmur_cache::Record]) -> Vec<String> {
    records.iter().map(|r| r.content.clone()).collect()
}
