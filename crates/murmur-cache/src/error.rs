//! Error types for caches and the reconciler.

use murmur_remote::RemoteError;
use thiserror::Error;

use crate::CollectionKey;

/// Errors returned synchronously by cache operations.
///
/// Validation runs before any state is touched, so an error means nothing
/// changed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The referenced parent record does not exist.
    #[error("parent {parent_id} not found in {collection}")]
    MissingParent {
        collection: CollectionKey,
        parent_id: String,
    },

    /// Nobody is signed in and placeholder authors are disabled.
    #[error("no author available")]
    MissingAuthor,

    /// No record with this id.
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: CollectionKey, id: String },

    /// The delete policy forbids deleting a record that has children.
    #[error("record {id} has {count} child records")]
    HasChildren { id: String, count: usize },

    /// The draft has no content, image or audio.
    #[error("record has no content")]
    EmptyContent,
}

/// Errors from a reconcile attempt.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend call failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The backend call exceeded its time bound.
    #[error("remote call timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// A newer reconcile of the same collection was applied first.
    #[error("reconcile of {0} superseded by a newer one")]
    Superseded(CollectionKey),

    /// No cache is registered for the collection.
    #[error("collection {0} is not registered")]
    Unregistered(CollectionKey),
}

impl SyncError {
    /// Worth one more attempt after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::TimedOut(_) => true,
            SyncError::Remote(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_denied())
    }
}
