//! Remote reconciliation for registered collections.
//!
//! The reconciler is the only component that talks to the backend. It
//! fetches authoritative collections and merges them into the caches, works
//! through the outbox of local writes, and keeps caches fresh in the
//! background from change notices and a polling timer.

use std::future::Future;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use murmur_remote::{ListQuery, RemoteBackend, RemoteError, SortOrder};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::collection::{ConfirmOutcome, SyncJob};
use crate::{
    CacheEvent, CollectionCache, CollectionKey, EventBus, LOCAL_ID_PREFIX, Notice, NoticeKind,
    Record, SyncConfig, SyncError,
};

/// How an initial load ended.
#[derive(Debug)]
pub enum LoadOutcome {
    /// The remote answered; the snapshot is authoritative.
    Remote { records: usize },
    /// No backend is configured; the store is the only source.
    LocalOnly { records: usize },
    /// The remote failed; the snapshot holds what the store had.
    Failed { records: usize, error: SyncError },
}

impl LoadOutcome {
    pub fn records(&self) -> usize {
        match self {
            LoadOutcome::Remote { records }
            | LoadOutcome::LocalOnly { records }
            | LoadOutcome::Failed { records, .. } => *records,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadOutcome::Failed { .. })
    }
}

struct Inner {
    backend: Option<Arc<dyn RemoteBackend>>,
    caches: DashMap<CollectionKey, Arc<CollectionCache>>,
    bus: EventBus,
    config: SyncConfig,
    outbox_tx: mpsc::UnboundedSender<SyncJob>,
    outbox_rx: Mutex<mpsc::UnboundedReceiver<SyncJob>>,
    /// Idempotency keys of inserts currently in flight.
    in_flight: DashSet<Uuid>,
    /// Collections with a retry already scheduled.
    retry_pending: DashSet<CollectionKey>,
}

/// Reconciles caches with the backend. Clones share state.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    /// Create a reconciler. Without a backend, the durable store is the only
    /// source of data and no remote writes are queued.
    pub fn new(backend: Option<Arc<dyn RemoteBackend>>, bus: EventBus, config: SyncConfig) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                backend,
                caches: DashMap::new(),
                bus,
                config,
                outbox_tx,
                outbox_rx: Mutex::new(outbox_rx),
                in_flight: DashSet::new(),
                retry_pending: DashSet::new(),
            }),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.inner.backend.is_some()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Take over remote sync for a cache.
    pub fn register(&self, cache: Arc<CollectionCache>) {
        if self.inner.backend.is_some() {
            cache.attach_outbox(self.inner.outbox_tx.clone());
        }
        debug!(collection = %cache.key(), "registered collection");
        self.inner.caches.insert(cache.key(), cache);
    }

    /// Registered collections, parents before children.
    pub fn registered(&self) -> Vec<CollectionKey> {
        CollectionKey::ALL
            .into_iter()
            .filter(|k| self.inner.caches.contains_key(k))
            .collect()
    }

    fn cache(&self, key: CollectionKey) -> Result<Arc<CollectionCache>, SyncError> {
        self.inner
            .caches
            .get(&key)
            .map(|c| Arc::clone(c.value()))
            .ok_or(SyncError::Unregistered(key))
    }

    /// Bound a backend call by `fetch_timeout`.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, SyncError> {
        let limit = self.inner.config.fetch_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::TimedOut(limit)),
        }
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Fetch a collection, merge it into the cache and persist the result.
    ///
    /// On failure a single retry is scheduled after `retry_delay`; if that
    /// fails too a dismissible notice is published. Policy denials publish a
    /// persistent notice and are not retried.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, key: CollectionKey) -> Result<Vec<Record>, SyncError> {
        match self.attempt(key).await {
            Ok(records) => Ok(records),
            Err(e) => {
                self.handle_failure(key, &e, true);
                Err(e)
            }
        }
    }

    /// Reconcile every registered collection, parents first.
    pub async fn reconcile_all(&self) -> Vec<(CollectionKey, Result<usize, SyncError>)> {
        let mut results = Vec::new();
        for key in self.registered() {
            let result = self.reconcile(key).await.map(|records| records.len());
            results.push((key, result));
        }
        results
    }

    async fn attempt(&self, key: CollectionKey) -> Result<Vec<Record>, SyncError> {
        let cache = self.cache(key)?;
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(cache.snapshot());
        };

        let ticket = cache.issue_ticket();
        // Newest rows first so the window always covers recent activity;
        // merge sorts into view order
        let query = ListQuery::default()
            .with_order(SortOrder::Descending)
            .with_limit(self.inner.config.fetch_limit);

        let rows = self
            .bounded(backend.list_records(key.table(), &query))
            .await?;
        let remote: Vec<Record> = rows.into_iter().map(Record::from_row).collect();
        let fetched = remote.len();

        let merged = cache.apply_remote(ticket, remote)?;
        let unconfirmed: Vec<&Record> = merged.iter().filter(|r| r.is_local()).collect();
        info!(
            collection = %key,
            fetched,
            merged = merged.len(),
            unconfirmed = unconfirmed.len(),
            "reconciled"
        );

        for record in unconfirmed {
            self.enqueue(SyncJob::Push {
                key,
                id: record.id.clone(),
            });
        }
        Ok(merged)
    }

    fn handle_failure(&self, key: CollectionKey, error: &SyncError, first_attempt: bool) {
        match error {
            SyncError::Superseded(_) => debug!(collection = %key, "reconcile superseded"),
            SyncError::Unregistered(_) => warn!(collection = %key, "reconcile of unregistered collection"),
            e if e.is_denied() => {
                warn!(collection = %key, error = %e, "reconcile denied by backend policy");
                self.inner.bus.notify(Notice::new(
                    NoticeKind::RemoteDenied,
                    Some(key),
                    format!("Access to {} was denied: {}", key, e),
                ));
            }
            e if first_attempt => {
                warn!(collection = %key, error = %e, "reconcile failed, retrying once");
                self.schedule_retry(key);
            }
            e => {
                error!(collection = %key, error = %e, "reconcile retry failed");
                self.inner.bus.notify(Notice::new(
                    NoticeKind::RemoteUnreachable,
                    Some(key),
                    format!("Could not reach the server for {}", key),
                ));
            }
        }
    }

    fn schedule_retry(&self, key: CollectionKey) {
        if !self.inner.retry_pending.insert(key) {
            trace!(collection = %key, "retry already scheduled");
            return;
        }

        let this = self.clone();
        let delay = self.inner.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.inner.retry_pending.remove(&key);
            match this.attempt(key).await {
                Ok(records) => info!(collection = %key, records = records.len(), "retry succeeded"),
                Err(e) => this.handle_failure(key, &e, false),
            }
        });
    }

    /// Hydrate a collection from the store, then await one reconcile.
    #[instrument(skip(self))]
    pub async fn initial_load(&self, key: CollectionKey) -> LoadOutcome {
        let cache = match self.cache(key) {
            Ok(cache) => cache,
            Err(error) => return LoadOutcome::Failed { records: 0, error },
        };
        let local = cache.load_from_store();

        if self.inner.backend.is_none() {
            return LoadOutcome::LocalOnly { records: local };
        }

        match self.reconcile(key).await {
            Ok(records) => LoadOutcome::Remote {
                records: records.len(),
            },
            Err(error) => LoadOutcome::Failed {
                records: local,
                error,
            },
        }
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    fn enqueue(&self, job: SyncJob) {
        if self.inner.outbox_tx.send(job).is_err() {
            warn!("outbox closed");
        }
    }

    /// Process queued jobs without the background worker. Returns how many
    /// were processed.
    pub async fn flush_outbox(&self) -> usize {
        let mut processed = 0;
        loop {
            let job = {
                let mut rx = self.inner.outbox_rx.lock().await;
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => break,
                }
            };
            self.process(job).await;
            processed += 1;
        }
        processed
    }

    async fn run_outbox(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let job = {
                let mut rx = self.inner.outbox_rx.lock().await;
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("outbox worker shutting down");
                            return;
                        }
                        continue;
                    }
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => return,
                    },
                }
            };
            self.process(job).await;
        }
    }

    async fn process(&self, job: SyncJob) {
        let key = job.key();
        let result = match job {
            SyncJob::Push { key, id } => self.push(key, &id).await,
            SyncJob::Mirror { key, id, patch } => {
                if id.starts_with(LOCAL_ID_PREFIX) {
                    return;
                }
                self.mirror(key, &id, &patch).await
            }
            SyncJob::Remove { key, id } => self.remove(key, &id).await,
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_denied() => {
                warn!(collection = %key, error = %e, "remote write denied by backend policy");
                self.inner.bus.notify(Notice::new(
                    NoticeKind::RemoteDenied,
                    Some(key),
                    format!("The server refused a change to {}: {}", key, e),
                ));
            }
            // Unconfirmed records are pushed again after the next reconcile
            Err(e) => warn!(collection = %key, error = %e, "remote write failed, keeping local state"),
        }
    }

    async fn push(&self, key: CollectionKey, id: &str) -> Result<(), SyncError> {
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(());
        };
        let cache = self.cache(key)?;
        let Some(record) = cache.get(id) else {
            trace!(collection = %key, id, "pushed record no longer cached");
            return Ok(());
        };
        if !record.is_local() {
            return Ok(());
        }
        // Re-queued once the parent is confirmed
        if record
            .parent_id
            .as_deref()
            .is_some_and(|p| p.starts_with(LOCAL_ID_PREFIX))
        {
            debug!(collection = %key, id, "parent not confirmed yet, deferring push");
            return Ok(());
        }

        let sent = record.to_new_row();
        if !self.inner.in_flight.insert(sent.client_key) {
            trace!(collection = %key, id, "insert already in flight");
            return Ok(());
        }
        let result = self
            .bounded(backend.insert_record(key.table(), &sent))
            .await;
        self.inner.in_flight.remove(&sent.client_key);

        let confirmed = Record::from_row(result?);
        match cache.confirm(id, &sent, confirmed) {
            ConfirmOutcome::Confirmed { id, pending } => {
                if !pending.is_empty() {
                    self.mirror(key, &id, &pending).await?;
                }
            }
            ConfirmOutcome::Gone { remote_id } => {
                debug!(collection = %key, remote_id, "record deleted while pushing, removing remotely");
                self.remove(key, &remote_id).await?;
            }
        }
        Ok(())
    }

    async fn mirror(
        &self,
        key: CollectionKey,
        id: &str,
        patch: &murmur_remote::RowPatch,
    ) -> Result<(), SyncError> {
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(());
        };
        match self
            .bounded(backend.update_record(key.table(), id, patch))
            .await
        {
            Err(SyncError::Remote(RemoteError::NotFound { .. })) => {
                debug!(collection = %key, id, "mirrored record gone remotely");
                Ok(())
            }
            other => other,
        }
    }

    async fn remove(&self, key: CollectionKey, id: &str) -> Result<(), SyncError> {
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(());
        };
        match self.bounded(backend.delete_record(key.table(), id)).await {
            Err(SyncError::Remote(RemoteError::NotFound { .. })) => Ok(()),
            other => other,
        }
    }

    // =========================================================================
    // Background
    // =========================================================================

    /// Spawn the outbox worker, one change listener per registered
    /// collection, the polling loop and the reload listener.
    ///
    /// Without a backend nothing is spawned.
    pub fn start(&self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Some(backend) = self.inner.backend.clone() else {
            info!("no backend configured, running local-only");
            return Vec::new();
        };

        info!(collections = ?self.registered(), "starting reconciler");
        let mut handles = Vec::new();

        {
            let this = self.clone();
            let shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { this.run_outbox(shutdown_rx).await }));
        }

        for key in self.registered() {
            let this = self.clone();
            let backend = Arc::clone(&backend);
            let shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                this.listen(key, backend, shutdown_rx).await
            }));
        }

        {
            let this = self.clone();
            let shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { this.poll(shutdown_rx).await }));
        }

        {
            let this = self.clone();
            let events = self.inner.bus.subscribe();
            handles.push(tokio::spawn(async move {
                this.listen_reloads(events, shutdown_rx).await
            }));
        }

        handles
    }

    async fn listen(
        &self,
        key: CollectionKey,
        backend: Arc<dyn RemoteBackend>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut subscription = backend.subscribe(key.table());
        let settle = self.inner.config.settle_delay;
        debug!(collection = %key, "change listener started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }

                notice = subscription.recv() => {
                    let Some(notice) = notice else {
                        debug!(collection = %key, "change subscription closed");
                        return;
                    };
                    trace!(collection = %key, kind = ?notice.kind, "change notice");

                    // Coalesce notices arriving within the settle window
                    let deadline = Instant::now() + settle;
                    let mut coalesced = 0usize;
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => break,
                            more = subscription.recv() => match more {
                                Some(_) => coalesced += 1,
                                None => return,
                            },
                        }
                    }
                    if coalesced > 0 {
                        trace!(collection = %key, coalesced, "coalesced change notices");
                    }

                    let _ = self.reconcile(key).await;
                }
            }
        }
    }

    async fn poll(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.inner.config.polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }

                _ = interval.tick() => {
                    trace!("polling reconcile");
                    self.reconcile_all().await;
                }
            }
        }
    }

    async fn listen_reloads(
        &self,
        mut events: broadcast::Receiver<CacheEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }

                event = events.recv() => match event {
                    Ok(CacheEvent::ReloadRequested { key: Some(key) }) => {
                        let _ = self.reconcile(key).await;
                    }
                    Ok(CacheEvent::ReloadRequested { key: None }) => {
                        self.reconcile_all().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "reload listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }
}
