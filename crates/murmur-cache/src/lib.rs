//! Offline-first record caches for murmur.
//!
//! Each collection (posts, comments, community chat, support chat) lives
//! in a [`CollectionCache`] that answers from memory, commits every write to
//! the durable store before returning, and hands the remote half of the
//! write to the [`Reconciler`]. The reconciler merges authoritative remote
//! data with records that exist only locally, without duplicates.
//!
//! ## Features
//!
//! - **Optimistic writes**: create, like, hide and delete never wait on the
//!   network
//! - **Reconciliation**: bounded fetches, one retry, superseded results
//!   discarded, local-only records kept and re-pushed
//! - **Background sync**: change notices (debounced) and polling
//! - **Profile propagation**: name/avatar edits rewritten into cached records
//! - **Support inbox**: conversations with unread counts

mod bus;
mod caches;
mod collection;
mod config;
mod error;
pub mod merge;
mod profile;
mod reconciler;
mod record;
mod session;
mod support;

pub use bus::{CacheEvent, EventBus, Notice, NoticeKind, ProfileUpdate};
pub use caches::Caches;
pub use collection::{CollectionCache, ConfirmOutcome, DeleteReport, SyncJob};
pub use config::{DeletePolicy, NetworkClass, SyncConfig};
pub use error::{CacheError, SyncError};
pub use profile::{ProfilePropagator, PropagationReport, spawn_profile_watcher};
pub use reconciler::{LoadOutcome, Reconciler};
pub use record::*;
pub use session::{AuthState, Session};
pub use support::{Conversation, SupportDesk};
