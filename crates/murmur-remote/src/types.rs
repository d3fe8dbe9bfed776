//! Wire types exchanged with the hosted backend.
//!
//! Enumerated fields (`kind`, `status`, `role`) stay strings here. Rows
//! come from a shared database that other clients write to as well, so
//! mapping them onto closed types is left to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Table holding author profiles. Change notices on it mean a name or
/// avatar may have moved.
pub const PROFILES_TABLE: &str = "profiles";

/// Author profile as embedded in a row or returned for the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAuthor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// A row as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub id: String,
    /// Idempotency key chosen by the client that created the row.
    #[serde(default)]
    pub client_key: Option<Uuid>,
    pub author_id: String,
    /// Author profile joined in by the backend, when available.
    #[serde(default)]
    pub author: Option<RemoteAuthor>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_duration: Option<u32>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub liked_by: Vec<String>,
}

fn default_kind() -> String {
    "text".to_string()
}

fn default_status() -> String {
    "active".to_string()
}

/// Payload for inserting a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRow {
    pub client_key: Uuid,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub kind: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<u32>,
    pub status: String,
    #[serde(default)]
    pub liked_by: Vec<String>,
}

/// Partial update for an existing row. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liked_by: Option<Vec<String>>,
}

impl RowPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.status.is_none() && self.liked_by.is_none()
    }
}

/// Sort direction on `created_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_param(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Filters for listing rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub order: SortOrder,
    pub limit: usize,
    /// Leave out rows whose status is `deleted`.
    pub exclude_deleted: bool,
    /// Only rows under this parent.
    pub parent_id: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            order: SortOrder::Ascending,
            limit: 500,
            exclude_deleted: true,
            parent_id: None,
        }
    }
}

impl ListQuery {
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// What kind of change a notice reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Notices were dropped; anything may have changed.
    Unknown,
}

impl ChangeKind {
    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => ChangeKind::Insert,
            "UPDATE" => ChangeKind::Update,
            "DELETE" => ChangeKind::Delete,
            _ => ChangeKind::Unknown,
        }
    }
}

/// "Something changed in this collection". Carries no payload the cache
/// relies on; receivers re-fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub collection: String,
    pub kind: ChangeKind,
    pub row_id: Option<String>,
}

impl ChangeNotice {
    pub fn new(collection: impl Into<String>, kind: ChangeKind, row_id: Option<String>) -> Self {
        Self {
            collection: collection.into(),
            kind,
            row_id,
        }
    }
}
