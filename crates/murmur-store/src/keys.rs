//! Well-known store keys.
//!
//! Key names are the contract between caches: any component that knows a
//! key may read or write it.

/// Current identity and session marker.
pub const AUTH_KEY: &str = "auth";

/// Posts feed.
pub const POSTS_KEY: &str = "posts";

/// Comments on posts.
pub const COMMENTS_KEY: &str = "comments";

/// Community chat messages.
pub const COMMUNITY_MESSAGES_KEY: &str = "community_messages";

/// Support chat messages across all conversations.
pub const SUPPORT_CONVERSATIONS_KEY: &str = "support_conversations";

/// Last-read timestamps for support conversations.
pub const SUPPORT_READ_MARKERS_KEY: &str = "support_read_markers";

/// Gamification counters.
pub const COUNTERS_KEY: &str = "counters";

/// Unlocked achievement markers.
pub const ACHIEVEMENTS_KEY: &str = "achievements";

/// Cache-only keys that can always be dropped.
pub const TRANSIENT_KEYS: &[&str] = &["feed_scroll"];

/// Prefixes of cache-only keys.
pub const TRANSIENT_PREFIXES: &[&str] = &["draft_", "tmp_"];

/// Whether a key holds disposable, cache-only data.
pub fn is_transient(key: &str) -> bool {
    TRANSIENT_KEYS.contains(&key) || TRANSIENT_PREFIXES.iter().any(|p| key.starts_with(p))
}
