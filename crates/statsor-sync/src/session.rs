//! Session state: who is signed in, and whether reads go to the real backend
//! or to the local demo dataset.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::SyncError;
use crate::source::Scope;
use crate::storage::{PersistedStore, SessionRecord};

/// Account id used for the demo session.
pub const DEMO_ACCOUNT: &str = "demo";

/// Which data source backs the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Real,
    Demo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    SignedOut,
    Real { account: String, token: String },
    Demo { account: String },
}

impl SessionState {
    /// Signed-out sessions report `Real` so nothing is ever served from demo
    /// data without an explicit demo activation.
    pub fn mode(&self) -> Mode {
        match self {
            SessionState::Demo { .. } => Mode::Demo,
            _ => Mode::Real,
        }
    }

    pub fn account(&self) -> Option<&str> {
        match self {
            SessionState::SignedOut => None,
            SessionState::Real { account, .. } | SessionState::Demo { account } => Some(account),
        }
    }

    /// The scope reads and writes run under, if signed in.
    pub fn scope(&self) -> Option<Scope> {
        match self {
            SessionState::SignedOut => None,
            SessionState::Real { account, token } => Some(Scope {
                account: account.clone(),
                token: Some(token.clone()),
            }),
            SessionState::Demo { account } => Some(Scope {
                account: account.clone(),
                token: None,
            }),
        }
    }

    fn from_record(record: SessionRecord) -> Self {
        match record.mode {
            Mode::Demo => SessionState::Demo {
                account: record.account_id,
            },
            Mode::Real => match record.token {
                Some(token) => SessionState::Real {
                    account: record.account_id,
                    token,
                },
                // A real session without credentials cannot make requests.
                None => SessionState::SignedOut,
            },
        }
    }
}

/// Shared, persisted session for one client.
///
/// Every transition bumps a generation counter; consumers compare it against
/// the last generation they saw to drop account-scoped state.
#[derive(Debug)]
pub struct SessionContext {
    state: RwLock<SessionState>,
    generation: AtomicU64,
    store: Arc<PersistedStore>,
}

impl SessionContext {
    /// A signed-out session.
    pub fn new(store: Arc<PersistedStore>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(SessionState::SignedOut),
            generation: AtomicU64::new(0),
            store,
        })
    }

    /// Rebuild the session from persisted state.
    pub fn restore(store: Arc<PersistedStore>) -> Arc<Self> {
        let state = store
            .load_session()
            .map(SessionState::from_record)
            .unwrap_or(SessionState::SignedOut);
        info!(mode = ?state.mode(), signed_in = state.account().is_some(), "restored session");
        Arc::new(Self {
            state: RwLock::new(state),
            generation: AtomicU64::new(0),
            store,
        })
    }

    pub fn store(&self) -> &Arc<PersistedStore> {
        &self.store
    }

    pub async fn current(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Current state together with its generation.
    pub async fn snapshot(&self) -> (u64, SessionState) {
        let state = self.state.read().await;
        (self.generation.load(Ordering::SeqCst), state.clone())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn mode(&self) -> Mode {
        self.state.read().await.mode()
    }

    /// Sign in against the real backend. Any demo artifacts are purged first.
    pub async fn login(&self, account: &str, token: &str) -> Result<(), SyncError> {
        if account.trim().is_empty() || token.trim().is_empty() {
            return Err(SyncError::Auth("account and token are required".into()));
        }

        let mut state = self.state.write().await;
        self.store.purge_demo()?;
        self.store.save_session(&SessionRecord {
            account_id: account.to_string(),
            mode: Mode::Real,
            token: Some(token.to_string()),
            email: None,
            started_at: Some(Utc::now()),
        })?;
        *state = SessionState::Real {
            account: account.to_string(),
            token: token.to_string(),
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(account, "signed in");
        Ok(())
    }

    /// Switch to the local demo dataset, seeding it if needed.
    pub async fn activate_demo(&self) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        self.store.demo_data_or_seed(DEMO_ACCOUNT)?;
        self.store.save_session(&SessionRecord {
            account_id: DEMO_ACCOUNT.to_string(),
            mode: Mode::Demo,
            token: None,
            email: None,
            started_at: Some(Utc::now()),
        })?;
        *state = SessionState::Demo {
            account: DEMO_ACCOUNT.to_string(),
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("demo mode activated");
        Ok(())
    }

    /// Sign out and purge the session and all demo artifacts.
    pub async fn logout(&self) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        self.store.clear_session()?;
        self.store.purge_demo()?;
        *state = SessionState::SignedOut;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("signed out");
        Ok(())
    }
}
