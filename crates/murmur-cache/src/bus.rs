//! Event bus connecting caches, the reconciler and profile propagation.

use tokio::sync::broadcast;
use tracing::trace;

use crate::{AuthorSnapshot, CollectionKey};

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Kinds of user-facing notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// Local storage is full; data is kept in memory only.
    StorageFull,
    /// The backend could not be reached, even after a retry.
    RemoteUnreachable,
    /// The backend's access policy rejected a request.
    RemoteDenied,
}

impl NoticeKind {
    /// Whether the user may dismiss the notice. Denials and storage
    /// exhaustion stay until resolved.
    pub fn dismissible(&self) -> bool {
        matches!(self, NoticeKind::RemoteUnreachable)
    }
}

/// A user-facing notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub collection: Option<CollectionKey>,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, collection: Option<CollectionKey>, message: impl Into<String>) -> Self {
        Self {
            kind,
            collection,
            message: message.into(),
        }
    }

    pub fn dismissible(&self) -> bool {
        self.kind.dismissible()
    }
}

/// An identity's profile edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub identity_id: String,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

impl ProfileUpdate {
    /// The edit that turns `before` into `after`, if the same identity's
    /// name or avatar moved.
    pub fn between(before: &AuthorSnapshot, after: &AuthorSnapshot) -> Option<Self> {
        if before.id != after.id {
            return None;
        }
        let name = (before.name != after.name).then(|| after.name.clone());
        let avatar = if before.avatar != after.avatar {
            after.avatar.clone()
        } else {
            None
        };
        if name.is_none() && avatar.is_none() {
            return None;
        }
        Some(Self {
            identity_id: after.id.clone(),
            name,
            avatar,
        })
    }
}

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A collection's snapshot changed.
    CollectionUpdated { key: CollectionKey, len: usize },
    /// An identity's name or avatar changed.
    ProfileChanged(ProfileUpdate),
    /// Someone asked for a fresh reconcile (`None` means every collection).
    ReloadRequested { key: Option<CollectionKey> },
    Notice(Notice),
}

/// Broadcast bus for [`CacheEvent`]s. Clones share the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn publish(&self, event: CacheEvent) {
        trace!(?event, "bus event");
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, notice: Notice) {
        self.publish(CacheEvent::Notice(notice));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}
