//! Record types shared by every collection.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use murmur_remote::{NewRow, RemoteAuthor, RemoteRow, RowPatch, SortOrder};
use murmur_store::keys;
use murmur_store::{MESSAGES_KEEP, POSTS_KEEP};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

/// Prefix of ids assigned to records the remote has not confirmed yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Prefix of synthesized guest identities.
pub const GUEST_ID_PREFIX: &str = "guest-";

/// Role of an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Support,
    Admin,
}

impl Role {
    /// Unknown roles are treated as plain users.
    pub fn from_wire(s: Option<&str>) -> Self {
        match s {
            Some("support") => Role::Support,
            Some("admin") => Role::Admin,
            _ => Role::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Support => "support",
            Role::Admin => "admin",
        }
    }

    /// Whether this role answers support conversations.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Support | Role::Admin)
    }
}

/// Payload discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    #[default]
    Text,
    Image,
    Audio,
    Emoji,
}

impl RecordKind {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "image" => RecordKind::Image,
            "audio" => RecordKind::Audio,
            "emoji" => RecordKind::Emoji,
            "text" => RecordKind::Text,
            other => {
                trace!(kind = other, "unknown record kind, treating as text");
                RecordKind::Text
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Text => "text",
            RecordKind::Image => "image",
            RecordKind::Audio => "audio",
            RecordKind::Emoji => "emoji",
        }
    }
}

/// Visibility status of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Active,
    Deleted,
    Hidden,
}

impl RecordStatus {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "deleted" => RecordStatus::Deleted,
            "hidden" => RecordStatus::Hidden,
            _ => RecordStatus::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Deleted => "deleted",
            RecordStatus::Hidden => "hidden",
        }
    }
}

/// Whether the remote has ever confirmed a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created here and not yet confirmed.
    Local,
    #[default]
    Remote,
}

/// Denormalized copy of an author's profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: Role,
}

impl AuthorSnapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
            role,
        }
    }

    /// A fresh guest identity.
    pub fn guest() -> Self {
        Self::new(format!("{}{}", GUEST_ID_PREFIX, Uuid::new_v4()), "Guest", Role::User)
    }

    pub fn is_guest(&self) -> bool {
        self.id.starts_with(GUEST_ID_PREFIX)
    }

    pub fn from_remote(author: &RemoteAuthor) -> Self {
        Self {
            id: author.id.clone(),
            name: author.name.clone().unwrap_or_else(|| "Unknown".to_string()),
            avatar: author.avatar_url.clone(),
            role: Role::from_wire(author.role.as_deref()),
        }
    }
}

/// Voice attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audio {
    pub url: String,
    pub duration_secs: u32,
}

/// A cached post, comment or chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Idempotency key sent with the remote insert. Rows created by other
    /// clients may not carry one.
    #[serde(default)]
    pub client_key: Option<Uuid>,
    pub author: AuthorSnapshot,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub kind: RecordKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Audio>,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub liked_by: BTreeSet<String>,
    #[serde(default)]
    pub origin: Origin,
}

impl Record {
    pub fn author_id(&self) -> &str {
        &self.author.id
    }

    /// Shown to consumers (neither deleted nor hidden).
    pub fn is_visible(&self) -> bool {
        self.status == RecordStatus::Active
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    /// Ordering key: `created_at`, ties broken by id.
    pub fn chronological(a: &Record, b: &Record) -> Ordering {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Same record under either its id or its idempotency key.
    pub fn same_as(&self, other: &Record) -> bool {
        self.id == other.id
            || matches!((self.client_key, other.client_key), (Some(a), Some(b)) if a == b)
    }

    /// Build a confirmed record from a backend row.
    ///
    /// Rows without an embedded author get a placeholder snapshot carrying
    /// only the id.
    pub fn from_row(row: RemoteRow) -> Self {
        let author = match &row.author {
            Some(author) => AuthorSnapshot::from_remote(author),
            None => AuthorSnapshot::new(row.author_id.clone(), "Unknown", Role::User),
        };
        let audio = row.audio_url.map(|url| Audio {
            url,
            duration_secs: row.audio_duration.unwrap_or(0),
        });

        Self {
            id: row.id,
            client_key: row.client_key,
            author,
            created_at: row.created_at,
            parent_id: row.parent_id,
            kind: RecordKind::from_wire(&row.kind),
            content: row.content,
            image_url: row.image_url,
            audio,
            status: RecordStatus::from_wire(&row.status),
            liked_by: row.liked_by.into_iter().collect(),
            origin: Origin::Remote,
        }
    }

    /// Insert payload carrying this record's current state.
    ///
    /// Records created before idempotency keys existed get a fresh one.
    pub fn to_new_row(&self) -> NewRow {
        NewRow {
            client_key: self.client_key.unwrap_or_else(Uuid::new_v4),
            author_id: self.author.id.clone(),
            created_at: self.created_at,
            parent_id: self.parent_id.clone(),
            kind: self.kind.as_str().to_string(),
            content: self.content.clone(),
            image_url: self.image_url.clone(),
            audio_url: self.audio.as_ref().map(|a| a.url.clone()),
            audio_duration: self.audio.as_ref().map(|a| a.duration_secs),
            status: self.status.as_str().to_string(),
            liked_by: self.liked_by.iter().cloned().collect(),
        }
    }

    /// Fields edited locally since `sent` was pushed.
    pub fn changes_since(&self, sent: &NewRow) -> RowPatch {
        let liked_by: Vec<String> = self.liked_by.iter().cloned().collect();
        RowPatch {
            content: (self.content != sent.content).then(|| self.content.clone()),
            status: (self.status.as_str() != sent.status)
                .then(|| self.status.as_str().to_string()),
            liked_by: (liked_by != sent.liked_by).then_some(liked_by),
        }
    }
}

/// Input for creating a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDraft {
    /// Explicit author; falls back to the session identity.
    pub author: Option<AuthorSnapshot>,
    pub parent_id: Option<String>,
    pub kind: RecordKind,
    pub content: String,
    pub image_url: Option<String>,
    pub audio: Option<Audio>,
}

impl RecordDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn emoji(emoji: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Emoji,
            content: emoji.into(),
            ..Default::default()
        }
    }

    pub fn image(url: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Image,
            content: caption.into(),
            image_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn audio(url: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            kind: RecordKind::Audio,
            audio: Some(Audio {
                url: url.into(),
                duration_secs,
            }),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_author(mut self, author: AuthorSnapshot) -> Self {
        self.author = Some(author);
        self
    }

    /// Whether the draft carries anything to show.
    pub fn has_payload(&self) -> bool {
        !self.content.trim().is_empty() || self.image_url.is_some() || self.audio.is_some()
    }
}

/// Optimistic edit applied to an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPatch {
    Like { identity_id: String },
    Unlike { identity_id: String },
    SetStatus(RecordStatus),
    EditContent(String),
}

impl RecordPatch {
    /// Apply to a record. Returns whether anything changed.
    pub fn apply(&self, record: &mut Record) -> bool {
        match self {
            RecordPatch::Like { identity_id } => record.liked_by.insert(identity_id.clone()),
            RecordPatch::Unlike { identity_id } => record.liked_by.remove(identity_id),
            RecordPatch::SetStatus(status) => {
                let changed = record.status != *status;
                record.status = *status;
                changed
            }
            RecordPatch::EditContent(content) => {
                let changed = record.content != *content;
                record.content = content.clone();
                changed
            }
        }
    }

    /// Remote patch mirroring this edit on an already-patched record.
    pub fn to_row_patch(&self, record: &Record) -> RowPatch {
        match self {
            RecordPatch::Like { .. } | RecordPatch::Unlike { .. } => RowPatch {
                liked_by: Some(record.liked_by.iter().cloned().collect()),
                ..Default::default()
            },
            RecordPatch::SetStatus(status) => RowPatch {
                status: Some(status.as_str().to_string()),
                ..Default::default()
            },
            RecordPatch::EditContent(content) => RowPatch {
                content: Some(content.clone()),
                ..Default::default()
            },
        }
    }
}

/// The cached collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKey {
    Posts,
    Comments,
    CommunityMessages,
    SupportMessages,
}

impl CollectionKey {
    pub const ALL: [CollectionKey; 4] = [
        CollectionKey::Posts,
        CollectionKey::Comments,
        CollectionKey::CommunityMessages,
        CollectionKey::SupportMessages,
    ];

    /// Durable store key holding the collection.
    pub fn store_key(&self) -> &'static str {
        match self {
            CollectionKey::Posts => keys::POSTS_KEY,
            CollectionKey::Comments => keys::COMMENTS_KEY,
            CollectionKey::CommunityMessages => keys::COMMUNITY_MESSAGES_KEY,
            CollectionKey::SupportMessages => keys::SUPPORT_CONVERSATIONS_KEY,
        }
    }

    /// Backend table name.
    pub fn table(&self) -> &'static str {
        match self {
            CollectionKey::Posts => "posts",
            CollectionKey::Comments => "comments",
            CollectionKey::CommunityMessages => "community_messages",
            CollectionKey::SupportMessages => "support_messages",
        }
    }

    /// View order of the snapshot. The feed shows newest first.
    pub fn order(&self) -> SortOrder {
        match self {
            CollectionKey::Posts => SortOrder::Descending,
            _ => SortOrder::Ascending,
        }
    }

    /// Records kept by the recent-subset fallback write.
    pub fn recent_limit(&self) -> usize {
        match self {
            CollectionKey::Posts => POSTS_KEEP,
            _ => MESSAGES_KEEP,
        }
    }

    /// Collection whose records this one's `parent_id` points at.
    pub fn parent(&self) -> Option<CollectionKey> {
        match self {
            CollectionKey::Comments => Some(CollectionKey::Posts),
            _ => None,
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table() == table)
    }
}

impl std::fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn sample() -> Record {
        Record {
            id: "local-1".into(),
            client_key: Some(Uuid::new_v4()),
            author: AuthorSnapshot::new("u1", "Ada", Role::User),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            parent_id: None,
            kind: RecordKind::Text,
            content: "hello".into(),
            image_url: None,
            audio: None,
            status: RecordStatus::Active,
            liked_by: BTreeSet::new(),
            origin: Origin::Local,
        }
    }

    #[test]
    fn test_row_roundtrip_keeps_payload() {
        let mut record = sample();
        record.kind = RecordKind::Audio;
        record.audio = Some(Audio {
            url: "https://cdn.example.test/a.ogg".into(),
            duration_secs: 12,
        });

        let new_row = record.to_new_row();
        let row = RemoteRow {
            id: "77".into(),
            client_key: Some(new_row.client_key),
            author_id: new_row.author_id.clone(),
            author: Some(RemoteAuthor {
                id: "u1".into(),
                name: Some("Ada".into()),
                avatar_url: None,
                role: Some("user".into()),
            }),
            created_at: new_row.created_at,
            parent_id: None,
            kind: new_row.kind.clone(),
            content: new_row.content.clone(),
            image_url: None,
            audio_url: new_row.audio_url.clone(),
            audio_duration: new_row.audio_duration,
            status: new_row.status.clone(),
            liked_by: Vec::new(),
        };

        let confirmed = Record::from_row(row);
        assert_eq!(confirmed.origin, Origin::Remote);
        assert_eq!(confirmed.audio, record.audio);
        assert!(confirmed.same_as(&record));
    }

    #[test]
    fn test_unknown_wire_values_fall_back() {
        assert_eq!(RecordKind::from_wire("sticker"), RecordKind::Text);
        assert_eq!(RecordStatus::from_wire("archived"), RecordStatus::Active);
        assert_eq!(Role::from_wire(Some("moderator")), Role::User);
        assert_eq!(Role::from_wire(None), Role::User);
    }

    #[test]
    fn test_patch_apply() {
        let mut record = sample();
        let like = RecordPatch::Like {
            identity_id: "u2".into(),
        };
        assert!(like.apply(&mut record));
        assert!(!like.apply(&mut record));
        assert_eq!(
            like.to_row_patch(&record).liked_by,
            Some(vec!["u2".to_string()])
        );

        assert!(RecordPatch::SetStatus(RecordStatus::Hidden).apply(&mut record));
        assert!(!record.is_visible());
    }

    #[test]
    fn test_changes_since_push() {
        let mut record = sample();
        let sent = record.to_new_row();
        assert!(record.changes_since(&sent).is_empty());

        record.content = "edited".into();
        let patch = record.changes_since(&sent);
        assert_eq!(patch.content.as_deref(), Some("edited"));
        assert!(patch.status.is_none());
    }

    #[test]
    fn test_persisted_shape_has_created_at() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["created_at"], "2024-05-01T12:00:00Z");
        assert_eq!(json["origin"], "local");
        assert_eq!(json["author"]["role"], "user");
    }

    #[test]
    fn test_collection_keys() {
        assert_eq!(CollectionKey::Posts.order(), SortOrder::Descending);
        assert_eq!(CollectionKey::Comments.parent(), Some(CollectionKey::Posts));
        assert_eq!(
            CollectionKey::from_table("support_messages"),
            Some(CollectionKey::SupportMessages)
        );
        assert_eq!(CollectionKey::CommunityMessages.store_key(), "community_messages");
    }
}
