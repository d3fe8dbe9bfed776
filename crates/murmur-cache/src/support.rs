//! Support inbox: conversations over support-chat messages.
//!
//! A conversation is keyed by the id of its non-staff participant; every
//! message in it carries that key as `parent_id`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use murmur_store::DurableStore;
use murmur_store::keys::SUPPORT_READ_MARKERS_KEY;
use tracing::warn;

use crate::{AuthorSnapshot, CacheError, CollectionCache, CollectionKey, Record, RecordDraft};

/// Summary of one support conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Participant id, also the `parent_id` of every message.
    pub key: String,
    /// The participant, as of their latest message.
    pub participant: Option<AuthorSnapshot>,
    pub last_message_at: DateTime<Utc>,
    pub last_message: String,
    pub message_count: usize,
    /// Participant messages newer than the staff read marker.
    pub unread_count: usize,
}

/// Support-chat view over the support messages cache.
pub struct SupportDesk {
    messages: Arc<CollectionCache>,
    store: Arc<DurableStore>,
    read_markers: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl SupportDesk {
    /// Create the desk, restoring read markers from the store.
    pub fn new(messages: Arc<CollectionCache>, store: Arc<DurableStore>) -> Self {
        let read_markers = store
            .read_json(SUPPORT_READ_MARKERS_KEY)
            .unwrap_or_default();
        Self {
            messages,
            store,
            read_markers: RwLock::new(read_markers),
        }
    }

    pub fn cache(&self) -> &Arc<CollectionCache> {
        &self.messages
    }

    /// Send a support message.
    ///
    /// Users always write into their own conversation, opening it on the
    /// first message. Staff must answer an existing conversation.
    pub fn send(&self, draft: RecordDraft) -> Result<Record, CacheError> {
        self.messages.create(draft)
    }

    /// Conversations, most recently active first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let markers = self.markers();
        let mut grouped: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for message in self.messages.list() {
            if let Some(key) = message.parent_id.clone() {
                grouped.entry(key).or_default().push(message);
            }
        }

        let mut conversations: Vec<Conversation> = grouped
            .into_iter()
            .filter_map(|(key, messages)| {
                let last = messages.iter().max_by(|a, b| Record::chronological(a, b))?;
                let participant = messages
                    .iter()
                    .filter(|m| m.author.id == key)
                    .max_by(|a, b| Record::chronological(a, b))
                    .map(|m| m.author.clone());
                let marker = markers.get(&key).copied();
                let unread_count = messages
                    .iter()
                    .filter(|m| !m.author.role.is_staff())
                    .filter(|m| marker.is_none_or(|read| m.created_at > read))
                    .count();

                Some(Conversation {
                    last_message_at: last.created_at,
                    last_message: last.content.clone(),
                    message_count: messages.len(),
                    participant,
                    unread_count,
                    key,
                })
            })
            .collect();

        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        conversations
    }

    /// Open a conversation as staff: marks it read and returns its messages.
    pub fn open_as_support(&self, key: &str) -> Result<Vec<Record>, CacheError> {
        let messages = self.messages(key);
        let Some(latest) = messages.iter().map(|m| m.created_at).max() else {
            return Err(CacheError::NotFound {
                collection: CollectionKey::SupportMessages,
                id: key.to_string(),
            });
        };

        let snapshot = {
            let mut markers = self
                .read_markers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            markers.insert(key.to_string(), latest);
            markers.clone()
        };
        if !self.store.write_json(SUPPORT_READ_MARKERS_KEY, &snapshot) {
            warn!(conversation = key, "failed to persist read marker");
        }
        Ok(messages)
    }

    /// Messages of one conversation, oldest first.
    pub fn messages(&self, key: &str) -> Vec<Record> {
        self.messages.children_of(key)
    }

    fn markers(&self) -> HashMap<String, DateTime<Utc>> {
        self.read_markers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
