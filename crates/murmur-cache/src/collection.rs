//! Local-first cache for one record collection.
//!
//! Every operation commits to memory and the durable store before it
//! returns; the remote side of a write is queued as a [`SyncJob`] for the
//! reconciler and never awaited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::Utc;
use murmur_remote::{NewRow, RowPatch, SortOrder};
use murmur_store::{DurableStore, PersistOutcome};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::merge::{insert_sorted, merge, sort_records};
use crate::{
    AuthorSnapshot, CacheError, CacheEvent, CollectionKey, DeletePolicy, EventBus,
    LOCAL_ID_PREFIX, Notice, NoticeKind, Origin, ProfileUpdate, Record, RecordDraft,
    RecordPatch, Session, SyncConfig, SyncError,
};

/// Remote half of a local write, processed by the reconciler's outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncJob {
    /// Insert the current state of a local record.
    Push { key: CollectionKey, id: String },
    /// Send an edit of a confirmed record.
    Mirror {
        key: CollectionKey,
        id: String,
        patch: RowPatch,
    },
    /// Delete a confirmed record.
    Remove { key: CollectionKey, id: String },
}

impl SyncJob {
    pub fn key(&self) -> CollectionKey {
        match self {
            SyncJob::Push { key, .. } | SyncJob::Mirror { key, .. } | SyncJob::Remove { key, .. } => {
                *key
            }
        }
    }
}

/// Result of a successful delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteReport {
    pub removed: Record,
    /// Child records deleted with it.
    pub cascaded: usize,
}

/// What happened when a pushed record came back confirmed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// The local record now carries the remote id. `pending` holds edits
    /// made while the insert was in flight.
    Confirmed { id: String, pending: RowPatch },
    /// The record was deleted locally before the insert returned.
    Gone { remote_id: String },
}

/// Cache for one collection.
pub struct CollectionCache {
    key: CollectionKey,
    records: RwLock<Vec<Record>>,
    store: Arc<DurableStore>,
    session: Arc<Session>,
    bus: EventBus,
    config: SyncConfig,
    parent: RwLock<Option<Weak<CollectionCache>>>,
    children: RwLock<Vec<Arc<CollectionCache>>>,
    outbox: RwLock<Option<mpsc::UnboundedSender<SyncJob>>>,
    /// Serializes store writes so the latest snapshot always lands last.
    persist_lock: Mutex<()>,
    tickets_issued: AtomicU64,
    ticket_applied: AtomicU64,
}

impl CollectionCache {
    /// Create an empty cache. Call [`load_from_store`](Self::load_from_store)
    /// to hydrate it.
    pub fn new(
        key: CollectionKey,
        store: Arc<DurableStore>,
        session: Arc<Session>,
        bus: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            key,
            records: RwLock::new(Vec::new()),
            store,
            session,
            bus,
            config,
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            outbox: RwLock::new(None),
            persist_lock: Mutex::new(()),
            tickets_issued: AtomicU64::new(0),
            ticket_applied: AtomicU64::new(0),
        }
    }

    /// Link a child collection whose `parent_id`s point into `parent`.
    pub fn link(parent: &Arc<CollectionCache>, child: &Arc<CollectionCache>) {
        *write_lock(&child.parent) = Some(Arc::downgrade(parent));
        write_lock(&parent.children).push(Arc::clone(child));
    }

    /// Route remote writes to a reconciler's outbox.
    pub fn attach_outbox(&self, tx: mpsc::UnboundedSender<SyncJob>) {
        *write_lock(&self.outbox) = Some(tx);
    }

    pub fn key(&self) -> CollectionKey {
        self.key
    }

    pub fn order(&self) -> SortOrder {
        self.key.order()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Visible records in view order.
    pub fn list(&self) -> Vec<Record> {
        self.read()
            .iter()
            .filter(|r| r.is_visible())
            .cloned()
            .collect()
    }

    /// Every cached record, hidden ones included, in view order.
    pub fn snapshot(&self) -> Vec<Record> {
        self.read().clone()
    }

    /// Visible records under a parent, in view order.
    pub fn children_of(&self, parent_id: &str) -> Vec<Record> {
        self.read()
            .iter()
            .filter(|r| r.is_visible() && r.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.read().iter().find(|r| r.id == id).cloned()
    }

    /// Number of cached records, hidden ones included.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether a record exists and is not deleted.
    pub fn contains(&self, id: &str) -> bool {
        self.read()
            .iter()
            .any(|r| r.id == id && r.status != crate::RecordStatus::Deleted)
    }

    /// Records the remote has not confirmed yet.
    pub fn unconfirmed(&self) -> Vec<Record> {
        self.read().iter().filter(|r| r.is_local()).cloned().collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Resolve the author for a draft: explicit author, then the session
    /// identity, then a guest placeholder adopted as the session identity.
    pub fn resolve_author(&self, draft: &RecordDraft) -> Result<AuthorSnapshot, CacheError> {
        if let Some(author) = &draft.author {
            return Ok(author.clone());
        }
        if let Some(identity) = self.session.current() {
            return Ok(identity);
        }
        if !self.config.allow_placeholder_author {
            return Err(CacheError::MissingAuthor);
        }
        let guest = AuthorSnapshot::guest();
        debug!(guest = %guest.id, "no identity, using guest author");
        self.session.set(guest.clone());
        Ok(guest)
    }

    /// Create a record locally and queue its remote insert.
    ///
    /// Returns as soon as the record is in memory and the store; never
    /// waits on the network.
    pub fn create(&self, draft: RecordDraft) -> Result<Record, CacheError> {
        if !draft.has_payload() {
            return Err(CacheError::EmptyContent);
        }
        self.check_parent(&draft)?;
        let author = self.resolve_author(&draft)?;
        let parent_id = self.parent_for(draft.parent_id, &author);

        let client_key = Uuid::new_v4();
        let record = Record {
            id: format!("{}{}", LOCAL_ID_PREFIX, client_key),
            client_key: Some(client_key),
            author,
            created_at: Utc::now(),
            parent_id,
            kind: draft.kind,
            content: draft.content,
            image_url: draft.image_url,
            audio: draft.audio,
            status: crate::RecordStatus::Active,
            liked_by: Default::default(),
            origin: Origin::Local,
        };

        insert_sorted(&mut self.write(), record.clone(), self.order());
        info!(collection = %self.key, id = %record.id, author = %record.author.id, "record created");

        self.persist();
        self.publish_updated();
        self.enqueue(SyncJob::Push {
            key: self.key,
            id: record.id.clone(),
        });
        Ok(record)
    }

    /// Comments need an existing post. Support messages from staff need an
    /// existing conversation; everyone else writes into their own.
    fn check_parent(&self, draft: &RecordDraft) -> Result<(), CacheError> {
        if self.key == CollectionKey::SupportMessages {
            let staff = draft
                .author
                .clone()
                .or_else(|| self.session.current())
                .is_some_and(|a| a.role.is_staff());
            let target = draft.parent_id.clone().unwrap_or_default();
            if staff && !self.has_conversation(&target) {
                return Err(CacheError::MissingParent {
                    collection: CollectionKey::SupportMessages,
                    parent_id: target,
                });
            }
            return Ok(());
        }

        let (Some(parent_key), Some(parent_id)) = (self.key.parent(), draft.parent_id.as_deref())
        else {
            return Ok(());
        };
        let parent = read_lock(&self.parent).as_ref().and_then(Weak::upgrade);
        match parent {
            Some(parent) if parent.contains(parent_id) => Ok(()),
            _ => Err(CacheError::MissingParent {
                collection: parent_key,
                parent_id: parent_id.to_string(),
            }),
        }
    }

    fn parent_for(&self, requested: Option<String>, author: &AuthorSnapshot) -> Option<String> {
        if self.key != CollectionKey::SupportMessages || author.role.is_staff() {
            return requested;
        }
        if requested.as_ref().is_some_and(|p| *p != author.id) {
            debug!(author = %author.id, "support message redirected to own conversation");
        }
        Some(author.id.clone())
    }

    /// Whether any support message belongs to conversation `key`.
    pub fn has_conversation(&self, key: &str) -> bool {
        !key.is_empty()
            && self
                .read()
                .iter()
                .any(|r| r.parent_id.as_deref() == Some(key))
    }

    /// Apply an edit optimistically and mirror it remotely.
    ///
    /// A failed remote mirror does not roll the local edit back.
    pub fn mutate(&self, id: &str, patch: RecordPatch) -> Result<Record, CacheError> {
        let (updated, changed) = {
            let mut records = self.write();
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| self.not_found(id))?;
            let changed = patch.apply(record);
            (record.clone(), changed)
        };

        if !changed {
            trace!(collection = %self.key, id, ?patch, "patch changed nothing");
            return Ok(updated);
        }

        debug!(collection = %self.key, id, ?patch, "record patched");
        self.persist();
        self.publish_updated();

        // Local records carry their current state when pushed
        if !updated.is_local() {
            self.enqueue(SyncJob::Mirror {
                key: self.key,
                id: id.to_string(),
                patch: patch.to_row_patch(&updated),
            });
        }
        Ok(updated)
    }

    /// Delete a record, applying the delete policy to child collections.
    pub fn delete(&self, id: &str) -> Result<DeleteReport, CacheError> {
        if !self.read().iter().any(|r| r.id == id) {
            return Err(self.not_found(id));
        }

        let children: Vec<Arc<CollectionCache>> = read_lock(&self.children).clone();
        if self.config.delete_policy == DeletePolicy::Reject {
            let count: usize = children.iter().map(|c| c.count_children(id)).sum();
            if count > 0 {
                return Err(CacheError::HasChildren {
                    id: id.to_string(),
                    count,
                });
            }
        }

        let removed = {
            let mut records = self.write();
            let pos = records
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| self.not_found(id))?;
            records.remove(pos)
        };
        info!(collection = %self.key, id, "record deleted");

        self.persist();
        self.publish_updated();
        if !removed.is_local() {
            self.enqueue(SyncJob::Remove {
                key: self.key,
                id: removed.id.clone(),
            });
        }

        let cascaded = match self.config.delete_policy {
            DeletePolicy::Cascade => children.iter().map(|c| c.remove_children_of(id)).sum(),
            DeletePolicy::Orphan | DeletePolicy::Reject => 0,
        };
        if cascaded > 0 {
            debug!(collection = %self.key, id, cascaded, "cascaded delete to children");
        }

        Ok(DeleteReport { removed, cascaded })
    }

    fn count_children(&self, parent_id: &str) -> usize {
        self.read()
            .iter()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id))
            .count()
    }

    fn remove_children_of(&self, parent_id: &str) -> usize {
        let removed: Vec<Record> = {
            let mut records = self.write();
            let (removed, kept): (Vec<Record>, Vec<Record>) = records
                .drain(..)
                .partition(|r| r.parent_id.as_deref() == Some(parent_id));
            *records = kept;
            removed
        };
        if removed.is_empty() {
            return 0;
        }

        self.persist();
        self.publish_updated();
        for record in removed.iter().filter(|r| !r.is_local()) {
            self.enqueue(SyncJob::Remove {
                key: self.key,
                id: record.id.clone(),
            });
        }
        removed.len()
    }

    // =========================================================================
    // Hydration and persistence
    // =========================================================================

    /// Hydrate from the durable store.
    ///
    /// Records already in memory win over stored ones with the same id. A
    /// missing or corrupt entry counts as an empty collection.
    pub fn load_from_store(&self) -> usize {
        let stored: Vec<Record> = self
            .store
            .read_json(self.key.store_key())
            .unwrap_or_default();

        let len = {
            let mut records = self.write();
            let mut combined: Vec<Record> = records.drain(..).collect();
            for record in stored {
                if !combined.iter().any(|r| r.same_as(&record)) {
                    combined.push(record);
                }
            }
            sort_records(&mut combined, self.order());
            *records = combined;
            records.len()
        };

        debug!(collection = %self.key, records = len, "hydrated from store");
        self.publish_updated();
        len
    }

    /// Write the current snapshot to the store.
    pub fn flush(&self) -> PersistOutcome {
        self.persist()
    }

    fn persist(&self) -> PersistOutcome {
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Stored oldest first so the fallback tiers keep the newest records
        let mut items = self.snapshot();
        if self.order() == SortOrder::Descending {
            items.reverse();
        }

        let outcome = self
            .store
            .write_tiered(self.key.store_key(), &items, self.key.recent_limit());
        if outcome.is_failed() {
            self.bus.notify(Notice::new(
                NoticeKind::StorageFull,
                Some(self.key),
                "Local storage is full; recent changes are kept in memory only",
            ));
        }
        outcome
    }

    // =========================================================================
    // Reconciler side
    // =========================================================================

    /// Ticket for a fetch about to start.
    pub fn issue_ticket(&self) -> u64 {
        self.tickets_issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a fetched remote collection into the snapshot.
    ///
    /// Fails with [`SyncError::Superseded`] if a fetch that started later
    /// was already applied.
    pub fn apply_remote(&self, ticket: u64, remote: Vec<Record>) -> Result<Vec<Record>, SyncError> {
        let (merged, adopted) = {
            let mut records = self.write();
            if self.ticket_applied.load(Ordering::SeqCst) >= ticket {
                debug!(collection = %self.key, ticket, "discarding superseded fetch");
                return Err(SyncError::Superseded(self.key));
            }
            self.ticket_applied.store(ticket, Ordering::SeqCst);

            let merged = merge(remote, &records, self.order());
            // Local records the remote already holds under a new id
            let adopted: Vec<(String, String)> = records
                .iter()
                .filter(|r| r.is_local())
                .filter_map(|local| {
                    merged
                        .iter()
                        .find(|m| !m.is_local() && local.client_key.is_some() && m.client_key == local.client_key)
                        .map(|m| (local.id.clone(), m.id.clone()))
                })
                .collect();
            *records = merged.clone();
            (merged, adopted)
        };

        self.persist();
        self.publish_updated();
        for (local_id, remote_id) in &adopted {
            self.reparent_children(local_id, remote_id);
        }
        Ok(merged)
    }

    /// Swap a pushed local record for its confirmed remote version.
    ///
    /// Matches on the local id or the idempotency key, since a reconcile may
    /// already have replaced the local record.
    pub fn confirm(&self, local_id: &str, sent: &NewRow, confirmed: Record) -> ConfirmOutcome {
        let outcome = {
            let mut records = self.write();
            let pos = records.iter().position(|r| {
                r.id == local_id || r.client_key == Some(sent.client_key)
            });
            let Some(pos) = pos else {
                return ConfirmOutcome::Gone {
                    remote_id: confirmed.id,
                };
            };

            let current = records.remove(pos);
            let pending = current.changes_since(sent);

            let mut merged = confirmed;
            if let Some(content) = &pending.content {
                merged.content = content.clone();
            }
            if pending.status.is_some() {
                merged.status = current.status;
            }
            if pending.liked_by.is_some() {
                merged.liked_by = current.liked_by.clone();
            }

            let id = merged.id.clone();
            insert_sorted(&mut records, merged, self.order());
            ConfirmOutcome::Confirmed { id, pending }
        };

        self.persist();
        self.publish_updated();
        if let ConfirmOutcome::Confirmed { id, .. } = &outcome {
            debug!(collection = %self.key, local_id, remote_id = %id, "record confirmed");
            if local_id != id {
                self.reparent_children(local_id, id);
            }
        }
        outcome
    }

    fn reparent_children(&self, old_parent: &str, new_parent: &str) {
        for child in read_lock(&self.children).iter() {
            child.reparent(old_parent, new_parent);
        }
    }

    /// Point children of a confirmed parent at its remote id and queue the
    /// pushes they were waiting on.
    fn reparent(&self, old_parent: &str, new_parent: &str) -> usize {
        let waiting: Vec<String> = {
            let mut records = self.write();
            let mut waiting = Vec::new();
            for record in records
                .iter_mut()
                .filter(|r| r.parent_id.as_deref() == Some(old_parent))
            {
                record.parent_id = Some(new_parent.to_string());
                if record.is_local() {
                    waiting.push(record.id.clone());
                }
            }
            waiting
        };
        if waiting.is_empty() {
            return 0;
        }

        debug!(collection = %self.key, old_parent, new_parent, moved = waiting.len(), "reparented children");
        self.persist();
        self.publish_updated();
        for id in &waiting {
            self.enqueue(SyncJob::Push {
                key: self.key,
                id: id.clone(),
            });
        }
        waiting.len()
    }

    /// Rewrite the denormalized author of every record by `update`'s
    /// identity. Returns how many records changed.
    pub fn rewrite_author(&self, update: &ProfileUpdate) -> usize {
        let changed = {
            let mut records = self.write();
            let mut changed = 0;
            for record in records
                .iter_mut()
                .filter(|r| r.author.id == update.identity_id)
            {
                let mut touched = false;
                if let Some(name) = &update.name
                    && record.author.name != *name
                {
                    record.author.name = name.clone();
                    touched = true;
                }
                if let Some(avatar) = &update.avatar
                    && record.author.avatar.as_ref() != Some(avatar)
                {
                    record.author.avatar = Some(avatar.clone());
                    touched = true;
                }
                if touched {
                    changed += 1;
                }
            }
            changed
        };

        if changed > 0 {
            self.persist();
            self.publish_updated();
        }
        changed
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn enqueue(&self, job: SyncJob) {
        match read_lock(&self.outbox).as_ref() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    warn!(collection = %self.key, "outbox closed, remote write dropped");
                }
            }
            None => trace!(collection = %self.key, ?job, "no reconciler attached, staying local"),
        }
    }

    fn publish_updated(&self) {
        self.bus.publish(CacheEvent::CollectionUpdated {
            key: self.key,
            len: self.len(),
        });
    }

    fn not_found(&self, id: &str) -> CacheError {
        CacheError::NotFound {
            collection: self.key,
            id: id.to_string(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Record>> {
        read_lock(&self.records)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Record>> {
        write_lock(&self.records)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
