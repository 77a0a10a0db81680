//! The data-source seam between the facade and a concrete backend.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::model::{Entity, ListFilter};

/// Who a request runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub account: String,
    /// Bearer token; `None` for the demo account.
    pub token: Option<String>,
}

impl Scope {
    pub fn demo(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            token: None,
        }
    }

    pub fn real(account: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            token: Some(token.into()),
        }
    }
}

/// CRUD over the entity tables.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn list<E: Entity>(
        &self,
        scope: &Scope,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<E>, SyncError>;

    /// `Ok(None)` when the row does not exist.
    async fn get<E: Entity>(&self, scope: &Scope, id: &str) -> Result<Option<E>, SyncError>;

    async fn add<E: Entity>(&self, scope: &Scope, draft: E::Draft) -> Result<E, SyncError>;

    async fn update<E: Entity>(
        &self,
        scope: &Scope,
        id: &str,
        draft: E::Draft,
    ) -> Result<E, SyncError>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete<E: Entity>(&self, scope: &Scope, id: &str) -> Result<bool, SyncError>;
}

/// Keep only rows owned by `account`.
pub fn scope_rows<E: Entity>(rows: Vec<E>, account: &str) -> Vec<E> {
    let total = rows.len();
    let owned: Vec<E> = rows
        .into_iter()
        .filter(|row| row.profile_id() == account)
        .collect();
    if owned.len() != total {
        tracing::warn!(
            kind = %E::KIND,
            dropped = total - owned.len(),
            "dropped rows owned by another account"
        );
    }
    owned
}
