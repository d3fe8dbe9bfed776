//! Quota-safe durable store.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, info, warn};

use crate::backend::{KeyValueBackend, MemoryBackend, entry_size};
use crate::eviction::{EvictionPolicy, EvictionReport, EvictionTier, trim_to_recent};

/// Result of persisting a collection with [`DurableStore::write_tiered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The whole collection was written.
    Full,
    /// Only the most recent `kept` items were written.
    Truncated { kept: usize },
    /// Only the newest item was written.
    NewestOnly,
    /// Nothing could be written; the collection lives in memory only.
    Failed,
}

impl PersistOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, PersistOutcome::Failed)
    }
}

/// Space the eviction pass is trying to make room for.
struct Target<'a> {
    key: &'a str,
    needed: usize,
}

/// Durable key-value store shared by every cache.
///
/// All operations are infallible from the caller's point of view: reads
/// return `None` on any fault and writes report success as a `bool`.
pub struct DurableStore {
    backend: Arc<dyn KeyValueBackend>,
    policy: EvictionPolicy,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DurableStore {
    /// Wrap a backend with the default eviction policy.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            policy: EvictionPolicy::default(),
        }
    }

    /// An unbounded in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Replace the eviction policy.
    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// The active eviction policy.
    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Read a raw value. `None` on a missing key or any read fault.
    pub fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "store read failed");
                None
            }
        }
    }

    /// Read and deserialize a value. Corrupt entries read as `None`.
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "store entry is not valid JSON, ignoring");
                None
            }
        }
    }

    /// Write a raw value.
    ///
    /// On a quota failure the store runs the two normal eviction tiers and
    /// retries exactly once. Returns `false` if the value could not be
    /// stored; the caller's in-memory state stays authoritative until a
    /// later write succeeds.
    pub fn write(&self, key: &str, value: &str) -> bool {
        match self.backend.set(key, value) {
            Ok(()) => true,
            Err(e) if e.is_quota() => {
                let target = Target {
                    key,
                    needed: entry_size(key, value),
                };
                let report = self.evict_normal(Some(&target));
                info!(
                    key,
                    tier = ?report.tier,
                    freed = report.freed(),
                    "evicted after quota failure, retrying write"
                );
                match self.backend.set(key, value) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(key, error = %e, "write failed after eviction");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(key, error = %e, "store write failed");
                false
            }
        }
    }

    /// Serialize and write a value.
    pub fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.write(key, &json),
            Err(e) => {
                error!(key, error = %e, "failed to serialize store entry");
                false
            }
        }
    }

    /// Persist a collection with progressively smaller fallbacks.
    ///
    /// `items` must be ordered oldest to newest. Tries the full collection,
    /// then the most recent `recent_limit` items, then the newest item alone.
    /// Only when the newest item still does not fit is the store cleared
    /// down to its allow-list.
    pub fn write_tiered<T: Serialize>(
        &self,
        key: &str,
        items: &[T],
        recent_limit: usize,
    ) -> PersistOutcome {
        if self.write_json(key, items) {
            return PersistOutcome::Full;
        }

        if recent_limit > 0 && items.len() > recent_limit {
            let recent = &items[items.len() - recent_limit..];
            if self.write_json(key, recent) {
                warn!(key, kept = recent_limit, total = items.len(), "persisted recent subset only");
                return PersistOutcome::Truncated { kept: recent_limit };
            }
        }

        let newest = &items[items.len().saturating_sub(1)..];
        if items.len() > 1 && self.write_json(key, newest) {
            warn!(key, total = items.len(), "persisted newest item only");
            return PersistOutcome::NewestOnly;
        }

        if let Ok(json) = serde_json::to_string(newest)
            && self.write_last_resort(key, &json)
        {
            warn!(key, total = items.len(), "persisted newest item after clearing the store");
            return if items.len() > 1 {
                PersistOutcome::NewestOnly
            } else {
                PersistOutcome::Full
            };
        }

        error!(key, total = items.len(), "could not persist collection, keeping it in memory only");
        PersistOutcome::Failed
    }

    /// Clear the store down to the allow-list and write `value`.
    ///
    /// Refuses to clear anything when `value` could not fit even in an
    /// empty store.
    fn write_last_resort(&self, key: &str, value: &str) -> bool {
        let needed = entry_size(key, value);
        if let Some(quota) = self.backend.quota()
            && needed > quota
        {
            warn!(key, needed, quota, "entry exceeds the whole quota, not clearing the store");
            return false;
        }

        let mut report = EvictionReport::start(self.total_size());
        self.clear_to_allow_list(&mut report);
        match self.backend.set(key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "write failed after last-resort eviction");
                false
            }
        }
    }

    /// Remove a key. Returns `false` on a backend fault.
    pub fn remove(&self, key: &str) -> bool {
        match self.backend.remove(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "store remove failed");
                false
            }
        }
    }

    /// All stored keys (empty on a backend fault).
    pub fn keys(&self) -> Vec<String> {
        self.backend.keys().unwrap_or_else(|e| {
            warn!(error = %e, "failed to list store keys");
            Vec::new()
        })
    }

    /// Total bytes charged against the quota (0 on a backend fault).
    pub fn total_size(&self) -> usize {
        self.backend.used_bytes().unwrap_or_else(|e| {
            warn!(error = %e, "failed to measure store size");
            0
        })
    }

    /// Whether the stored bytes exceed the backend's quota, as happens when
    /// a data directory is reopened with a smaller quota.
    pub fn over_quota(&self) -> bool {
        self.backend
            .quota()
            .is_some_and(|quota| self.total_size() > quota)
    }

    /// Free space following the eviction policy.
    ///
    /// Runs both normal tiers (transient keys, then collection truncation).
    /// The last-resort clear only runs if the store is still over its quota
    /// afterwards.
    pub fn evict(&self) -> EvictionReport {
        let mut report = self.evict_normal(None);
        if self.over_quota() {
            self.clear_to_allow_list(&mut report);
        }
        report
    }

    /// Whether removing enough has made room for `target`.
    fn fits(&self, target: &Target<'_>) -> bool {
        let Some(quota) = self.backend.quota() else {
            return true;
        };
        let current = self
            .read(target.key)
            .map(|v| entry_size(target.key, &v))
            .unwrap_or(0);
        self.total_size().saturating_sub(current) + target.needed <= quota
    }

    /// Tiers 1 and 2. Stops after tier 1 when it made room for `target`.
    fn evict_normal(&self, target: Option<&Target<'_>>) -> EvictionReport {
        let mut report = EvictionReport::start(self.total_size());
        if report.bytes_before == 0 {
            return report;
        }

        // Tier 1: transient, cache-only entries
        for key in self.keys() {
            if self.policy.is_disposable(&key) && self.remove(&key) {
                debug!(key = %key, "evicted transient entry");
                report.removed.push(key);
            }
        }
        if !report.removed.is_empty() {
            report.tier = EvictionTier::Transient;
        }
        if target.is_some_and(|t| self.fits(t)) {
            report.bytes_after = self.total_size();
            return report;
        }

        // Tier 2: keep only the most recent records of large collections
        for rule in &self.policy.trim_rules {
            let Some(raw) = self.read(&rule.key) else {
                continue;
            };
            let Some(trimmed) = trim_to_recent(&raw, rule.keep) else {
                continue;
            };
            match self.backend.set(&rule.key, &trimmed) {
                Ok(()) => {
                    debug!(key = %rule.key, keep = rule.keep, "truncated collection");
                    report.truncated.push(rule.key.clone());
                }
                Err(e) => warn!(key = %rule.key, error = %e, "failed to truncate collection"),
            }
        }
        if !report.truncated.is_empty() {
            report.tier = EvictionTier::Truncated;
        }

        report.bytes_after = self.total_size();
        report
    }

    /// Tier 3: clear everything, then put the allow-list back.
    fn clear_to_allow_list(&self, report: &mut EvictionReport) {
        warn!("normal eviction insufficient, clearing store except allow-list");
        let saved: Vec<(String, String)> = self
            .policy
            .allow_list
            .iter()
            .filter_map(|key| self.read(key).map(|value| (key.clone(), value)))
            .collect();

        if let Err(e) = self.backend.clear() {
            error!(error = %e, "failed to clear store during last-resort eviction");
        }
        for (key, value) in saved {
            match self.backend.set(&key, &value) {
                Ok(()) => report.restored.push(key),
                Err(e) => error!(key = %key, error = %e, "failed to restore allow-listed entry"),
            }
        }

        report.tier = EvictionTier::LastResort;
        report.bytes_after = self.total_size();
    }
}
