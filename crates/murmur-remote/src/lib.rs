//! Client side of murmur's hosted backend.
//!
//! The backend is a relational store with a realtime change feed. The rest
//! of murmur only sees the [`RemoteBackend`] trait: list, insert, update and
//! delete rows, subscribe to "something changed" notices, and look up the
//! signed-in identity.
//!
//! ## Features
//!
//! - **REST**: [`RestBackend`], a PostgREST-style HTTP client
//! - **Realtime**: [`ChangeFeed`], a websocket listener that turns change
//!   frames into [`ChangeNotice`]s
//! - **Memory**: [`MemoryBackend`], an in-process backend with failure
//!   injection for tests and offline sessions

mod backend;
mod error;
pub mod feed;
pub mod memory;
mod rest;
mod types;

pub use backend::{ChangeHub, ChangeSubscription, RemoteBackend};
pub use error::RemoteError;
pub use feed::ChangeFeed;
pub use memory::{FailureMode, MemoryBackend};
pub use rest::RestBackend;
pub use types::*;
