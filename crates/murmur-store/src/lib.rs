//! Durable key-value storage for murmur's local-first caches.
//!
//! Values are JSON strings keyed by well-known names. Writes never fail
//! loudly: when the backend runs out of quota the store evicts transient
//! entries, trims the largest collections down to their most recent records
//! and, as a last resort, clears everything except a small allow-list.
//!
//! ## Features
//!
//! - **Backends**: [`FileBackend`] (one file per key, atomic writes) and
//!   [`MemoryBackend`] (ephemeral, used by tests), both with optional quotas
//! - **Eviction**: tiered space recovery that never drops the auth entry
//!   outside the last-resort tier
//! - **Tiered writes**: full collection, recent subset, newest item

mod backend;
mod error;
mod eviction;
mod file;
pub mod keys;
mod store;

pub use backend::{KeyValueBackend, MemoryBackend, entry_size};
pub use error::StoreError;
pub use eviction::{
    EvictionPolicy, EvictionReport, EvictionTier, MESSAGES_KEEP, POSTS_KEEP, TrimRule, trim_to_recent,
};
pub use file::FileBackend;
pub use store::{DurableStore, PersistOutcome};
