//! The backend abstraction and change-notice fan-out.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{ChangeKind, ChangeNotice, ListQuery, NewRow, RemoteAuthor, RemoteError, RemoteRow, RowPatch};

/// Capacity of the change-notice channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Operations murmur needs from its hosted backend.
///
/// Collections are table names. Failures are reported as [`RemoteError`];
/// callers distinguish transient faults from policy denials with
/// [`RemoteError::is_transient`] and [`RemoteError::is_denied`].
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// List rows of a collection, joined with their author profiles.
    async fn list_records(
        &self,
        collection: &str,
        query: &ListQuery,
    ) -> Result<Vec<RemoteRow>, RemoteError>;

    /// Insert a row. Inserting twice with the same `client_key` returns the
    /// existing row instead of creating a second one.
    async fn insert_record(&self, collection: &str, row: &NewRow)
    -> Result<RemoteRow, RemoteError>;

    /// Apply a partial update to a row.
    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        patch: &RowPatch,
    ) -> Result<(), RemoteError>;

    /// Delete a row.
    async fn delete_record(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// Subscribe to change notices for a collection.
    fn subscribe(&self, collection: &str) -> ChangeSubscription;

    /// Profile of the signed-in user, if any.
    async fn current_identity(&self) -> Result<Option<RemoteAuthor>, RemoteError>;
}

/// Fan-out point for change notices.
///
/// Producers (the realtime feed, or an in-memory backend) publish; each
/// [`ChangeSubscription`] filters to its own collection.
#[derive(Debug, Clone)]
pub struct ChangeHub {
    tx: broadcast::Sender<ChangeNotice>,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a notice to all current subscribers.
    pub fn publish(&self, notice: ChangeNotice) {
        // No subscribers is fine
        let _ = self.tx.send(notice);
    }

    /// Subscribe to one collection.
    pub fn subscribe(&self, collection: &str) -> ChangeSubscription {
        ChangeSubscription {
            collection: collection.to_string(),
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions across all collections.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live subscription to one collection's change notices.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct ChangeSubscription {
    collection: String,
    rx: broadcast::Receiver<ChangeNotice>,
}

impl ChangeSubscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Wait for the next notice on this collection.
    ///
    /// Returns `None` once the producer side is gone. If notices were
    /// dropped because this subscriber fell behind, a single
    /// [`ChangeKind::Unknown`] notice stands in for them.
    pub async fn recv(&mut self) -> Option<ChangeNotice> {
        loop {
            match self.rx.recv().await {
                Ok(notice) if notice.collection == self.collection => return Some(notice),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(collection = %self.collection, skipped, "change subscriber lagged");
                    return Some(ChangeNotice::new(
                        self.collection.clone(),
                        ChangeKind::Unknown,
                        None,
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving notices.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_subscription_filters_by_collection() {
        let hub = ChangeHub::new();
        let mut posts = hub.subscribe("posts");

        hub.publish(ChangeNotice::new("comments", ChangeKind::Insert, None));
        hub.publish(ChangeNotice::new("posts", ChangeKind::Update, Some("7".into())));

        let notice = posts.recv().await.unwrap();
        assert_eq!(notice.kind, ChangeKind::Update);
        assert_eq!(notice.row_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_receiver() {
        let hub = ChangeHub::new();
        let sub = hub.subscribe("posts");
        assert_eq!(hub.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_hub_ends_subscription() {
        let hub = ChangeHub::new();
        let mut sub = hub.subscribe("posts");
        drop(hub);
        assert!(sub.recv().await.is_none());
    }
}
