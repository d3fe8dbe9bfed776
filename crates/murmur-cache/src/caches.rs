//! The full set of caches for one client, wired together.

use std::sync::Arc;

use murmur_store::DurableStore;
use tracing::info;

use crate::{
    CollectionCache, CollectionKey, EventBus, ProfilePropagator, Reconciler, Session,
    SupportDesk, SyncConfig,
};

/// Posts, comments, community chat and support chat over one store.
pub struct Caches {
    pub store: Arc<DurableStore>,
    pub session: Arc<Session>,
    pub bus: EventBus,
    pub posts: Arc<CollectionCache>,
    pub comments: Arc<CollectionCache>,
    pub community: Arc<CollectionCache>,
    pub support: Arc<CollectionCache>,
}

impl Caches {
    /// Build every cache. Comments are linked under posts.
    pub fn new(store: Arc<DurableStore>, bus: EventBus, config: SyncConfig) -> Self {
        let session = Arc::new(Session::load(Arc::clone(&store)));
        let make = |key| {
            Arc::new(CollectionCache::new(
                key,
                Arc::clone(&store),
                Arc::clone(&session),
                bus.clone(),
                config.clone(),
            ))
        };

        let posts = make(CollectionKey::Posts);
        let comments = make(CollectionKey::Comments);
        let community = make(CollectionKey::CommunityMessages);
        let support = make(CollectionKey::SupportMessages);
        CollectionCache::link(&posts, &comments);

        Self {
            store,
            session,
            bus,
            posts,
            comments,
            community,
            support,
        }
    }

    pub fn get(&self, key: CollectionKey) -> &Arc<CollectionCache> {
        match key {
            CollectionKey::Posts => &self.posts,
            CollectionKey::Comments => &self.comments,
            CollectionKey::CommunityMessages => &self.community,
            CollectionKey::SupportMessages => &self.support,
        }
    }

    pub fn all(&self) -> Vec<Arc<CollectionCache>> {
        CollectionKey::ALL
            .into_iter()
            .map(|key| Arc::clone(self.get(key)))
            .collect()
    }

    /// Hydrate every cache from the store.
    pub fn load_all(&self) -> usize {
        self.all().iter().map(|c| c.load_from_store()).sum()
    }

    /// Write every cache to the store, e.g. on shutdown.
    pub fn flush(&self) {
        for cache in self.all() {
            cache.flush();
        }
        info!("caches flushed");
    }

    /// Hand every cache to a reconciler.
    pub fn register_with(&self, reconciler: &Reconciler) {
        for cache in self.all() {
            reconciler.register(cache);
        }
    }

    pub fn propagator(&self) -> ProfilePropagator {
        ProfilePropagator::new(self.all(), Arc::clone(&self.session))
    }

    pub fn support_desk(&self) -> SupportDesk {
        SupportDesk::new(Arc::clone(&self.support), Arc::clone(&self.store))
    }
}
