//! Signed-in identity, persisted under the auth key.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use murmur_remote::{RemoteBackend, RemoteError};
use murmur_store::DurableStore;
use murmur_store::keys::AUTH_KEY;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{AuthorSnapshot, ProfileUpdate};

/// Persisted shape of the auth entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    #[serde(default)]
    pub identity: Option<AuthorSnapshot>,
    /// When the current identity signed in.
    #[serde(default)]
    pub signed_in_at: Option<DateTime<Utc>>,
}

/// Current identity and session marker.
pub struct Session {
    store: Arc<DurableStore>,
    state: RwLock<AuthState>,
}

impl Session {
    /// Load the session from the store. A missing or corrupt entry means
    /// nobody is signed in.
    pub fn load(store: Arc<DurableStore>) -> Self {
        let state: AuthState = store.read_json(AUTH_KEY).unwrap_or_default();
        if let Some(identity) = &state.identity {
            debug!(identity = %identity.id, "restored session");
        }
        Self {
            store,
            state: RwLock::new(state),
        }
    }

    pub fn current(&self) -> Option<AuthorSnapshot> {
        self.read().identity.clone()
    }

    pub fn state(&self) -> AuthState {
        self.read().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.read().identity.is_some()
    }

    /// Adopt an identity and persist it.
    pub fn set(&self, identity: AuthorSnapshot) {
        info!(identity = %identity.id, role = identity.role.as_str(), "session identity set");
        let mut state = self.write();
        let same = state.identity.as_ref().is_some_and(|i| i.id == identity.id);
        if !same {
            state.signed_in_at = Some(Utc::now());
        }
        state.identity = Some(identity);
        self.persist(&state);
    }

    pub fn clear(&self) {
        info!("session cleared");
        let mut state = self.write();
        *state = AuthState::default();
        self.persist(&state);
    }

    /// Adopt whatever identity the backend reports as signed in.
    pub async fn refresh(
        &self,
        backend: &dyn RemoteBackend,
    ) -> Result<Option<AuthorSnapshot>, RemoteError> {
        match backend.current_identity().await? {
            Some(author) => {
                let identity = AuthorSnapshot::from_remote(&author);
                self.set(identity.clone());
                Ok(Some(identity))
            }
            None => {
                if self.is_signed_in() {
                    self.clear();
                }
                Ok(None)
            }
        }
    }

    /// Refresh from the backend and report how the signed-in identity's
    /// profile moved, if it did.
    pub async fn refresh_profile(
        &self,
        backend: &dyn RemoteBackend,
    ) -> Result<Option<ProfileUpdate>, RemoteError> {
        let before = self.current();
        let after = self.refresh(backend).await?;
        Ok(match (before, after) {
            (Some(before), Some(after)) => ProfileUpdate::between(&before, &after),
            _ => None,
        })
    }

    /// Apply a profile edit if it concerns the current identity.
    pub fn apply_profile(&self, update: &ProfileUpdate) -> bool {
        let mut state = self.write();
        let Some(identity) = state.identity.as_mut() else {
            return false;
        };
        if identity.id != update.identity_id {
            return false;
        }
        if let Some(name) = &update.name {
            identity.name = name.clone();
        }
        if let Some(avatar) = &update.avatar {
            identity.avatar = Some(avatar.clone());
        }
        self.persist(&state);
        true
    }

    fn persist(&self, state: &AuthState) {
        if !self.store.write_json(AUTH_KEY, state) {
            warn!("failed to persist session");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AuthState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AuthState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
