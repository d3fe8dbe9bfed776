//! Propagation of profile edits into cached records.

use std::sync::Arc;

use murmur_remote::{PROFILES_TABLE, RemoteBackend};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{CacheEvent, CollectionCache, CollectionKey, EventBus, ProfileUpdate, Session};

/// What a propagation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Rewritten records per collection; untouched collections are left out.
    pub rewritten: Vec<(CollectionKey, usize)>,
    /// Whether the session identity was updated too.
    pub session_updated: bool,
}

impl PropagationReport {
    pub fn total(&self) -> usize {
        self.rewritten.iter().map(|(_, n)| n).sum()
    }
}

/// Rewrites denormalized author snapshots when an identity's profile
/// changes. Purely local; the backend joins fresh profiles on its own.
pub struct ProfilePropagator {
    caches: Vec<Arc<CollectionCache>>,
    session: Arc<Session>,
}

impl ProfilePropagator {
    pub fn new(caches: Vec<Arc<CollectionCache>>, session: Arc<Session>) -> Self {
        Self { caches, session }
    }

    /// Apply a profile edit to every cached record by that identity.
    pub fn propagate(&self, update: &ProfileUpdate) -> PropagationReport {
        let rewritten: Vec<(CollectionKey, usize)> = self
            .caches
            .iter()
            .map(|cache| (cache.key(), cache.rewrite_author(update)))
            .filter(|(_, n)| *n > 0)
            .collect();
        let session_updated = self.session.apply_profile(update);

        let report = PropagationReport {
            rewritten,
            session_updated,
        };
        info!(
            identity = %update.identity_id,
            records = report.total(),
            session_updated,
            "profile propagated"
        );
        report
    }

    /// Apply `ProfileChanged` events from the bus until shutdown.
    pub fn spawn_listener(
        self: Arc<Self>,
        bus: &EventBus,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }

                    event = events.recv() => match event {
                        Ok(CacheEvent::ProfileChanged(update)) => {
                            self.propagate(&update);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "profile listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        })
    }
}

/// Follow profile change notices from the backend. Each notice refreshes the
/// session, and a moved name or avatar of the signed-in identity is published
/// as [`CacheEvent::ProfileChanged`] for the propagator to apply.
pub fn spawn_profile_watcher(
    session: Arc<Session>,
    backend: Arc<dyn RemoteBackend>,
    bus: &EventBus,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let bus = bus.clone();
    let mut notices = backend.subscribe(PROFILES_TABLE);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }

                notice = notices.recv() => {
                    if notice.is_none() {
                        return;
                    }
                    match session.refresh_profile(backend.as_ref()).await {
                        Ok(Some(update)) => {
                            debug!(identity = %update.identity_id, "own profile changed");
                            bus.publish(CacheEvent::ProfileChanged(update));
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "profile refresh failed"),
                    }
                }
            }
        }
    })
}
