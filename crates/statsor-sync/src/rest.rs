//! REST backend client.
//!
//! Routes, per entity kind:
//! - `GET    /<path>?<column>=<value>` list
//! - `GET    /<path>/<id>`             fetch one
//! - `POST   /<path>`                  create
//! - `PUT    /<path>/<id>`             update
//! - `DELETE /<path>/<id>`             delete
//!
//! Responses use the envelope `{"data": ...}` or `{"error": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SyncError;
use crate::model::{Entity, EntityKind, ListFilter};
use crate::source::{DataSource, Scope, scope_rows};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<String>,
}

/// Client for the Statsor REST API.
#[derive(Debug, Clone)]
pub struct RestDataSource {
    http: Client,
    base_url: String,
}

impl RestDataSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}{}", self.base_url, kind.path())
    }

    fn item_url(&self, kind: EntityKind, id: &str) -> String {
        format!("{}{}/{}", self.base_url, kind.path(), id)
    }

    fn authorize(
        &self,
        request: RequestBuilder,
        scope: &Scope,
    ) -> Result<RequestBuilder, SyncError> {
        let token = scope
            .token
            .as_deref()
            .ok_or_else(|| SyncError::Auth("no access token for this session".into()))?;
        Ok(request.bearer_auth(token))
    }

    /// Unwrap the response envelope, mapping failures onto [`SyncError`].
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>, SyncError> {
        let status = response.status();
        let text = response.text().await.map_err(|e| {
            SyncError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&text)
                .ok()
                .and_then(|envelope| envelope.error)
                .unwrap_or_else(|| {
                    if text.is_empty() {
                        status.to_string()
                    } else {
                        text.clone()
                    }
                });
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(message),
                _ => SyncError::Api {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        if text.trim().is_empty() {
            return Ok(None);
        }

        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| SyncError::InvalidResponse(format!("malformed envelope: {}", e)))?;
        if let Some(error) = envelope.error {
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: error,
            });
        }
        Ok(envelope.data)
    }

    fn require<T>(kind: EntityKind, data: Option<T>) -> Result<T, SyncError> {
        data.ok_or_else(|| SyncError::InvalidResponse(format!("{} response had no data", kind)))
    }
}

fn is_not_found(err: &SyncError) -> bool {
    matches!(err, SyncError::Api { status: 404, .. })
}

#[async_trait]
impl DataSource for RestDataSource {
    async fn list<E: Entity>(
        &self,
        scope: &Scope,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<E>, SyncError> {
        let mut request = self.http.get(self.collection_url(E::KIND));
        if let Some(filter) = filter {
            request = request.query(&[(filter.column.as_str(), filter.value.as_str())]);
        }
        let response = self.authorize(request, scope)?.send().await?;
        let rows: Vec<E> = self.handle_response(response).await?.unwrap_or_default();
        debug!(kind = %E::KIND, count = rows.len(), "listed rows");
        Ok(scope_rows(rows, &scope.account))
    }

    async fn get<E: Entity>(&self, scope: &Scope, id: &str) -> Result<Option<E>, SyncError> {
        let request = self.http.get(self.item_url(E::KIND, id));
        let response = self.authorize(request, scope)?.send().await?;
        match self.handle_response::<E>(response).await {
            Ok(row) => Ok(row.filter(|row| row.profile_id() == scope.account)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn add<E: Entity>(&self, scope: &Scope, draft: E::Draft) -> Result<E, SyncError> {
        let request = self.http.post(self.collection_url(E::KIND)).json(&draft);
        let response = self.authorize(request, scope)?.send().await?;
        let created = Self::require(E::KIND, self.handle_response::<E>(response).await?)?;
        debug!(kind = %E::KIND, id = created.id(), "created row");
        Ok(created)
    }

    async fn update<E: Entity>(
        &self,
        scope: &Scope,
        id: &str,
        draft: E::Draft,
    ) -> Result<E, SyncError> {
        let request = self.http.put(self.item_url(E::KIND, id)).json(&draft);
        let response = self.authorize(request, scope)?.send().await?;
        match self.handle_response::<E>(response).await {
            Ok(data) => Self::require(E::KIND, data),
            Err(e) if is_not_found(&e) => Err(SyncError::NotFound {
                kind: E::KIND,
                id: id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn delete<E: Entity>(&self, scope: &Scope, id: &str) -> Result<bool, SyncError> {
        let request = self.http.delete(self.item_url(E::KIND, id));
        let response = self.authorize(request, scope)?.send().await?;
        match self.handle_response::<serde_json::Value>(response).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
