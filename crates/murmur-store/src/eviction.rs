//! Eviction policy and collection trimming.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::keys;

/// Posts kept when the feed is trimmed under quota pressure.
pub const POSTS_KEEP: usize = 100;

/// Chat messages kept when a message collection is trimmed.
pub const MESSAGES_KEEP: usize = 200;

/// Trim one collection entry down to its most recent records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimRule {
    pub key: String,
    pub keep: usize,
}

impl TrimRule {
    pub fn new(key: impl Into<String>, keep: usize) -> Self {
        Self {
            key: key.into(),
            keep,
        }
    }
}

/// What eviction may touch, and in which order.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Collections truncated in the second tier, largest first.
    pub trim_rules: Vec<TrimRule>,
    /// Entries that survive the last-resort clear.
    pub allow_list: Vec<String>,
    /// Entries the normal tiers never remove.
    pub protected: Vec<String>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            trim_rules: vec![
                TrimRule::new(keys::POSTS_KEY, POSTS_KEEP),
                TrimRule::new(keys::COMMUNITY_MESSAGES_KEY, MESSAGES_KEEP),
                TrimRule::new(keys::SUPPORT_CONVERSATIONS_KEY, MESSAGES_KEEP),
            ],
            allow_list: vec![
                keys::AUTH_KEY.to_string(),
                keys::POSTS_KEY.to_string(),
                keys::COMMUNITY_MESSAGES_KEY.to_string(),
            ],
            protected: vec![keys::AUTH_KEY.to_string()],
        }
    }
}

impl EvictionPolicy {
    /// Whether the first tier may drop this key.
    pub fn is_disposable(&self, key: &str) -> bool {
        keys::is_transient(key) && !self.protected.iter().any(|p| p == key)
    }
}

/// How far an eviction pass had to escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvictionTier {
    /// Nothing needed to be (or could be) freed.
    Nothing,
    /// Transient keys were removed.
    Transient,
    /// Collections were truncated to their most recent records.
    Truncated,
    /// Everything outside the allow-list was cleared.
    LastResort,
}

/// Outcome of an eviction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub tier: EvictionTier,
    pub bytes_before: usize,
    pub bytes_after: usize,
    /// Transient keys removed.
    pub removed: Vec<String>,
    /// Collection keys truncated.
    pub truncated: Vec<String>,
    /// Allow-listed keys written back after a last-resort clear.
    pub restored: Vec<String>,
}

impl EvictionReport {
    pub(crate) fn start(bytes_before: usize) -> Self {
        Self {
            tier: EvictionTier::Nothing,
            bytes_before,
            bytes_after: bytes_before,
            removed: Vec::new(),
            truncated: Vec::new(),
            restored: Vec::new(),
        }
    }

    /// Bytes released by the pass.
    pub fn freed(&self) -> usize {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

fn created_at_of(item: &Value) -> Option<DateTime<Utc>> {
    item.get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Keep only the `keep` most recent elements of a JSON array of records.
///
/// Recency is the `created_at` field; elements without one rank oldest and
/// ties go to the later position. The kept elements stay in their original
/// order. Returns `None` when the value is not an array or is already small
/// enough.
pub fn trim_to_recent(raw: &str, keep: usize) -> Option<String> {
    let Value::Array(items) = serde_json::from_str::<Value>(raw).ok()? else {
        return None;
    };
    if items.len() <= keep {
        return None;
    }

    let mut ranked: Vec<(usize, Option<DateTime<Utc>>)> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (i, created_at_of(item)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

    let mut kept: Vec<usize> = ranked.into_iter().take(keep).map(|(i, _)| i).collect();
    kept.sort_unstable();

    let trimmed: Vec<&Value> = kept.iter().map(|&i| &items[i]).collect();
    serde_json::to_string(&trimmed).ok()
}
