//! HTTP client for a PostgREST-style backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

use crate::feed::ChangeFeed;
use crate::{
    ChangeHub, ChangeSubscription, ListQuery, NewRow, RemoteAuthor, RemoteBackend, RemoteError,
    RemoteRow, RowPatch,
};

/// Embedded author join requested on every row read.
const ROW_SELECT: &str = "*,author:profiles(id,name,avatar_url,role)";

/// Postgres error code for a row-level security violation.
const RLS_VIOLATION: &str = "42501";

/// Default bound on a single request, connect included.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the hosted backend's REST and auth endpoints.
pub struct RestBackend {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Arc<RwLock<Option<String>>>,
    hub: ChangeHub,
}

impl RestBackend {
    /// Create a client for the project at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_timeout(base_url, api_key, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom per-request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .build()?;

        let base_url: String = base_url.into();
        let api_key: String = api_key.into();
        if base_url.is_empty() || api_key.is_empty() {
            return Err(RemoteError::NotConfigured);
        }

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            access_token: Arc::new(RwLock::new(None)),
            hub: ChangeHub::new(),
        })
    }

    /// Set (or clear) the signed-in user's access token.
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Hub that change notices for this backend are published on.
    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    /// Realtime feed publishing into this backend's subscriptions.
    pub fn change_feed(&self, tables: Vec<String>) -> ChangeFeed {
        ChangeFeed::new(
            ChangeFeed::url_for(&self.base_url, &self.api_key),
            tables,
            self.hub.clone(),
        )
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    async fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.read().await.clone();
        let bearer = token.unwrap_or_else(|| self.api_key.clone());
        builder.header("apikey", &self.api_key).bearer_auth(bearer)
    }

    /// Parse a JSON body, mapping failure statuses to errors.
    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        let response = Self::check_status(response).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn check_status(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<PostgrestError>(&text).ok();
        let message = body
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| text.clone());

        let rls = body.as_ref().and_then(|b| b.code.as_deref()) == Some(RLS_VIOLATION);
        if rls || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Denied {
                status: status.as_u16(),
                message,
            });
        }

        if status.is_server_error() {
            return Err(RemoteError::Unreachable(format!("{}: {}", status, message)));
        }

        Err(RemoteError::InvalidResponse(format!(
            "request failed ({}): {}",
            status, message
        )))
    }
}

/// Error body returned by PostgREST.
#[derive(Debug, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
}

/// User object returned by the auth endpoint.
#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: UserMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

#[async_trait]
impl RemoteBackend for RestBackend {
    #[instrument(skip(self, query), fields(limit = query.limit))]
    async fn list_records(
        &self,
        collection: &str,
        query: &ListQuery,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let mut params: Vec<(&str, String)> = vec![
            ("select", ROW_SELECT.to_string()),
            ("order", format!("created_at.{}", query.order.as_param())),
            ("limit", query.limit.to_string()),
        ];
        if query.exclude_deleted {
            params.push(("status", "neq.deleted".to_string()));
        }
        if let Some(parent) = &query.parent_id {
            params.push(("parent_id", format!("eq.{}", parent)));
        }

        let request = self
            .authorized(self.http.get(self.table_url(collection)).query(&params))
            .await;
        let rows: Vec<RemoteRow> = Self::handle_response(request.send().await?).await?;
        debug!(count = rows.len(), "listed rows");
        Ok(rows)
    }

    #[instrument(skip(self, row), fields(client_key = %row.client_key))]
    async fn insert_record(
        &self,
        collection: &str,
        row: &NewRow,
    ) -> Result<RemoteRow, RemoteError> {
        // Upsert on the idempotency key so a re-sent insert returns the
        // row created by the first attempt
        let request = self
            .authorized(
                self.http
                    .post(self.table_url(collection))
                    .query(&[("select", ROW_SELECT), ("on_conflict", "client_key")])
                    .header("Prefer", "return=representation,resolution=merge-duplicates")
                    .json(&[row]),
            )
            .await;

        let mut rows: Vec<RemoteRow> = Self::handle_response(request.send().await?).await?;
        if rows.is_empty() {
            return Err(RemoteError::InvalidResponse(
                "insert returned no rows".to_string(),
            ));
        }
        let inserted = rows.swap_remove(0);
        trace!(id = %inserted.id, "row inserted");
        Ok(inserted)
    }

    #[instrument(skip(self, patch))]
    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        patch: &RowPatch,
    ) -> Result<(), RemoteError> {
        let request = self
            .authorized(
                self.http
                    .patch(self.table_url(collection))
                    .query(&[("id", format!("eq.{}", id)), ("select", "id".to_string())])
                    .header("Prefer", "return=representation")
                    .json(patch),
            )
            .await;

        let touched: Vec<serde_json::Value> = Self::handle_response(request.send().await?).await?;
        if touched.is_empty() {
            return Err(RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_record(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let request = self
            .authorized(
                self.http
                    .delete(self.table_url(collection))
                    .query(&[("id", format!("eq.{}", id)), ("select", "id".to_string())])
                    .header("Prefer", "return=representation"),
            )
            .await;

        let touched: Vec<serde_json::Value> = Self::handle_response(request.send().await?).await?;
        if touched.is_empty() {
            return Err(RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn subscribe(&self, collection: &str) -> ChangeSubscription {
        self.hub.subscribe(collection)
    }

    async fn current_identity(&self) -> Result<Option<RemoteAuthor>, RemoteError> {
        if self.access_token.read().await.is_none() {
            return Ok(None);
        }

        let url = format!("{}/auth/v1/user", self.base_url);
        let response = self.authorized(self.http.get(&url)).await.send().await?;

        // An expired session means nobody is signed in
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("access token rejected, no current identity");
            return Ok(None);
        }

        let user: AuthUser = Self::handle_response(response).await?;
        Ok(Some(RemoteAuthor {
            id: user.id,
            name: user.user_metadata.name.or(user.email),
            avatar_url: user.user_metadata.avatar_url,
            role: user.user_metadata.role,
        }))
    }
}
