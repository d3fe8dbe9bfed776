//! In-process backend.
//!
//! Behaves like the hosted backend: idempotent inserts keyed on
//! `client_key`, author profiles joined on read, change notices on every
//! write. Failure injection covers the faults the reconciler has to
//! survive: offline, policy denials, hangs and latency.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{
    ChangeHub, ChangeKind, ChangeNotice, ChangeSubscription, ListQuery, NewRow, RemoteAuthor,
    PROFILES_TABLE, RemoteBackend, RemoteError, RemoteRow, RowPatch, SortOrder,
};

/// Injected fault for every call to a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    #[default]
    Online,
    /// Every call fails as unreachable.
    Offline,
    /// Writes are rejected by access policy; reads succeed.
    Denied,
    /// Calls never complete.
    Hang,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<RemoteRow>>,
    profiles: HashMap<String, RemoteAuthor>,
    identity: Option<RemoteAuthor>,
    mode: FailureMode,
    latency: Option<Duration>,
    /// Calls left that fail as unreachable before `mode` applies again.
    fail_next: u32,
}

/// Backend that keeps every table in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    hub: ChangeHub,
    next_id: AtomicU64,
    calls: DashMap<&'static str, usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: FailureMode) {
        debug!(?mode, "memory backend failure mode");
        self.lock().mode = mode;
    }

    pub fn mode(&self) -> FailureMode {
        self.lock().mode
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Fail the next `count` calls as unreachable.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn set_identity(&self, identity: Option<RemoteAuthor>) {
        let mut state = self.lock();
        if let Some(author) = &identity {
            state.profiles.insert(author.id.clone(), author.clone());
        }
        state.identity = identity;
    }

    /// Create or replace an author profile. Rows pick it up on the next read.
    pub fn put_profile(&self, author: RemoteAuthor) {
        let id = author.id.clone();
        {
            let mut state = self.lock();
            if state.identity.as_ref().is_some_and(|i| i.id == author.id) {
                state.identity = Some(author.clone());
            }
            state.profiles.insert(author.id.clone(), author);
        }
        self.hub
            .publish(ChangeNotice::new(PROFILES_TABLE, ChangeKind::Update, Some(id)));
    }

    /// Load rows without publishing notices.
    pub fn seed(&self, collection: &str, rows: Vec<RemoteRow>) {
        self.lock()
            .tables
            .entry(collection.to_string())
            .or_default()
            .extend(rows);
    }

    /// Insert a row as another client would, bypassing failure injection.
    pub fn insert_external(&self, collection: &str, row: &NewRow) -> RemoteRow {
        let inserted = self.insert_now(collection, row);
        self.hub.publish(ChangeNotice::new(
            collection,
            ChangeKind::Insert,
            Some(inserted.id.clone()),
        ));
        inserted
    }

    /// Raw rows of a collection, as stored.
    pub fn rows(&self, collection: &str) -> Vec<RemoteRow> {
        self.lock()
            .tables
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of calls made to an operation (`list`, `insert`, `update`,
    /// `delete`, `identity`).
    pub fn calls(&self, op: &str) -> usize {
        self.calls.get(op).map(|c| *c).unwrap_or(0)
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    async fn gate(&self, op: &'static str, write: bool) -> Result<(), RemoteError> {
        *self.calls.entry(op).or_insert(0) += 1;

        let (mode, latency, forced) = {
            let mut state = self.lock();
            let forced = state.fail_next > 0;
            if forced {
                state.fail_next -= 1;
            }
            (state.mode, state.latency, forced)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if forced {
            return Err(RemoteError::Unreachable("injected failure".to_string()));
        }

        match mode {
            FailureMode::Online => Ok(()),
            FailureMode::Offline => Err(RemoteError::Unreachable("offline".to_string())),
            FailureMode::Denied if write => Err(RemoteError::Denied {
                status: 403,
                message: "new row violates row-level security policy".to_string(),
            }),
            FailureMode::Denied => Ok(()),
            FailureMode::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn with_author(state: &MemoryState, mut row: RemoteRow) -> RemoteRow {
        row.author = Some(
            state
                .profiles
                .get(&row.author_id)
                .cloned()
                .unwrap_or_else(|| RemoteAuthor {
                    id: row.author_id.clone(),
                    name: None,
                    avatar_url: None,
                    role: None,
                }),
        );
        row
    }

    fn insert_now(&self, collection: &str, row: &NewRow) -> RemoteRow {
        let mut state = self.lock();

        let existing = state
            .tables
            .get(collection)
            .and_then(|rows| rows.iter().find(|r| r.client_key == Some(row.client_key)))
            .cloned();
        if let Some(existing) = existing {
            trace!(id = %existing.id, "insert matched existing client key");
            return Self::with_author(&state, existing);
        }

        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let stored = RemoteRow {
            id,
            client_key: Some(row.client_key),
            author_id: row.author_id.clone(),
            author: None,
            created_at: row.created_at,
            parent_id: row.parent_id.clone(),
            kind: row.kind.clone(),
            content: row.content.clone(),
            image_url: row.image_url.clone(),
            audio_url: row.audio_url.clone(),
            audio_duration: row.audio_duration,
            status: row.status.clone(),
            liked_by: row.liked_by.clone(),
        };
        state
            .tables
            .entry(collection.to_string())
            .or_default()
            .push(stored.clone());
        Self::with_author(&state, stored)
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn list_records(
        &self,
        collection: &str,
        query: &ListQuery,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.gate("list", false).await?;

        let state = self.lock();
        let mut rows: Vec<RemoteRow> = state
            .tables
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|r| !query.exclude_deleted || r.status != "deleted")
                    .filter(|r| query.parent_id.is_none() || r.parent_id == query.parent_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if query.order == SortOrder::Descending {
            rows.reverse();
        }
        rows.truncate(query.limit);

        Ok(rows
            .into_iter()
            .map(|row| Self::with_author(&state, row))
            .collect())
    }

    async fn insert_record(
        &self,
        collection: &str,
        row: &NewRow,
    ) -> Result<RemoteRow, RemoteError> {
        self.gate("insert", true).await?;
        Ok(self.insert_external(collection, row))
    }

    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        patch: &RowPatch,
    ) -> Result<(), RemoteError> {
        self.gate("update", true).await?;

        {
            let mut state = self.lock();
            let row = state
                .tables
                .get_mut(collection)
                .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
                .ok_or_else(|| RemoteError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;

            if let Some(content) = &patch.content {
                row.content = content.clone();
            }
            if let Some(status) = &patch.status {
                row.status = status.clone();
            }
            if let Some(liked_by) = &patch.liked_by {
                row.liked_by = liked_by.clone();
            }
        }

        self.hub.publish(ChangeNotice::new(
            collection,
            ChangeKind::Update,
            Some(id.to_string()),
        ));
        Ok(())
    }

    async fn delete_record(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.gate("delete", true).await?;

        {
            let mut state = self.lock();
            let rows = state.tables.entry(collection.to_string()).or_default();
            let before = rows.len();
            rows.retain(|r| r.id != id);
            if rows.len() == before {
                return Err(RemoteError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
        }

        self.hub.publish(ChangeNotice::new(
            collection,
            ChangeKind::Delete,
            Some(id.to_string()),
        ));
        Ok(())
    }

    fn subscribe(&self, collection: &str) -> ChangeSubscription {
        self.hub.subscribe(collection)
    }

    async fn current_identity(&self) -> Result<Option<RemoteAuthor>, RemoteError> {
        self.gate("identity", false).await?;
        Ok(self.lock().identity.clone())
    }
}
