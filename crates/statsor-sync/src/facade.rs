//! The single entry point the UI (or CLI) talks to.
//!
//! Reads go through the [`FallbackResolver`] and always produce a value.
//! Mutations validate first, then run against the active data source and,
//! once committed, invalidate the table's cache namespace, notify local
//! observers and broadcast to other tabs, in one synchronous step.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{
    Action, BroadcastHub, BroadcastMessage, BroadcastSync, Incoming, MessageListener,
};
use crate::cache::CacheStore;
use crate::changefeed::{
    ChangeKind, ChangeSubscriptionManager, ChangefeedTransport, ChannelKey, ChannelStatus,
    Subscription, WebSocketTransport,
};
use crate::config::SyncConfig;
use crate::demo::DemoDataSource;
use crate::error::{ErrorClass, SyncError};
use crate::fallback::{FallbackResolver, Origin, ResolveOptions, Resolved};
use crate::model::{
    AttendanceRecord, ClubData, ClubDataDraft, Entity, EntityKind, ListFilter, Match, MatchDraft,
    Player, PlayerDraft, Team, TeamDraft,
};
use crate::rest::RestDataSource;
use crate::session::{Mode, SessionContext, SessionState};
use crate::source::{DataSource, Scope};
use crate::validation::{self, ValidationMode};

/// Where a change notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A mutation made through this facade.
    Local,
    /// Another tab sharing the broadcast hub.
    Remote,
    /// The backend changefeed.
    Changefeed,
}

impl From<ChangeKind> for Action {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => Action::Create,
            ChangeKind::Update => Action::Update,
            ChangeKind::Delete => Action::Delete,
        }
    }
}

/// Notifications for observers of the facade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DataEvent {
    /// Data for `kind` changed; cached reads of it were dropped.
    Changed {
        kind: EntityKind,
        action: Action,
        id: Option<String>,
        origin: ChangeOrigin,
    },
    /// Cross-tab messages for `kind` were lost; refetch it.
    Refresh { kind: EntityKind },
    /// An operation needed a signed-in session.
    SignInRequired,
    /// A changefeed channel failed; live updates for it are off.
    ChannelDegraded { key: String, reason: String },
}

/// Rows this client wrote recently, so the changefeed echo of the same write
/// does not notify twice.
#[derive(Debug)]
struct EchoLedger {
    window: Duration,
    writes: DashMap<(EntityKind, String), Instant>,
}

impl EchoLedger {
    fn new(window: Duration) -> Self {
        Self {
            window,
            writes: DashMap::new(),
        }
    }

    fn record(&self, kind: EntityKind, id: &str) {
        let now = Instant::now();
        self.writes
            .retain(|_, at| now.saturating_duration_since(*at) < self.window);
        self.writes.insert((kind, id.to_string()), now);
    }

    fn is_echo(&self, kind: EntityKind, id: &str) -> bool {
        let now = Instant::now();
        let key = (kind, id.to_string());
        self.writes
            .remove_if(&key, |_, at| now.saturating_duration_since(*at) >= self.window);
        self.writes.contains_key(&key)
    }
}

fn table_prefix(kind: EntityKind) -> String {
    format!("{}_", kind.table())
}

fn list_key(kind: EntityKind, account: &str, filter: Option<&ListFilter>) -> String {
    match filter {
        Some(filter) => format!("{}_{}:{}", kind.table(), account, filter),
        None => format!("{}_{}:all", kind.table(), account),
    }
}

fn item_key(kind: EntityKind, account: &str, id: &str) -> String {
    format!("{}_{}:id={}", kind.table(), account, id)
}

/// The data source for the current mode.
enum Backend<'a> {
    Real(&'a RestDataSource),
    Demo(&'a DemoDataSource),
}

#[async_trait]
impl<'a> DataSource for Backend<'a> {
    async fn list<E: Entity>(
        &self,
        scope: &Scope,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<E>, SyncError> {
        match self {
            Backend::Real(source) => source.list(scope, filter).await,
            Backend::Demo(source) => source.list(scope, filter).await,
        }
    }

    async fn get<E: Entity>(&self, scope: &Scope, id: &str) -> Result<Option<E>, SyncError> {
        match self {
            Backend::Real(source) => source.get(scope, id).await,
            Backend::Demo(source) => source.get(scope, id).await,
        }
    }

    async fn add<E: Entity>(&self, scope: &Scope, draft: E::Draft) -> Result<E, SyncError> {
        match self {
            Backend::Real(source) => source.add::<E>(scope, draft).await,
            Backend::Demo(source) => source.add::<E>(scope, draft).await,
        }
    }

    async fn update<E: Entity>(
        &self,
        scope: &Scope,
        id: &str,
        draft: E::Draft,
    ) -> Result<E, SyncError> {
        match self {
            Backend::Real(source) => source.update::<E>(scope, id, draft).await,
            Backend::Demo(source) => source.update::<E>(scope, id, draft).await,
        }
    }

    async fn delete<E: Entity>(&self, scope: &Scope, id: &str) -> Result<bool, SyncError> {
        match self {
            Backend::Real(source) => source.delete::<E>(scope, id).await,
            Backend::Demo(source) => source.delete::<E>(scope, id).await,
        }
    }
}

/// Builder for [`DataAccess`].
pub struct DataAccessBuilder {
    config: SyncConfig,
    session: Arc<SessionContext>,
    hub: Option<Arc<BroadcastHub>>,
    transport: Option<Arc<dyn ChangefeedTransport>>,
}

impl DataAccessBuilder {
    /// Join an existing broadcast hub (one per client; each facade is a tab).
    pub fn hub(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Use a specific changefeed transport instead of the WebSocket default,
    /// which authenticates with the session's token.
    pub fn transport(mut self, transport: Arc<dyn ChangefeedTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the facade and start listening for other tabs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<DataAccess>, SyncError> {
        let config = self.config;
        config.validate()?;

        let cache = Arc::new(CacheStore::new(config.cache_ttl));
        let (events, _) = broadcast::channel(config.broadcast_capacity);
        let hub = self
            .hub
            .unwrap_or_else(|| BroadcastHub::new(config.broadcast_capacity));
        let transport: Arc<dyn ChangefeedTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let websocket = WebSocketTransport::new(config.changefeed_url.clone())
                    .with_session(Arc::clone(&self.session));
                Arc::new(websocket)
            }
        };

        let status_events = events.clone();
        let changefeed = ChangeSubscriptionManager::with_status(
            transport,
            Arc::new(move |key: &ChannelKey, status: &ChannelStatus| {
                if let ChannelStatus::Error(reason) = status {
                    let _ = status_events.send(DataEvent::ChannelDegraded {
                        key: key.to_string(),
                        reason: reason.clone(),
                    });
                }
            }),
        );

        let access = Arc::new(DataAccess {
            rest: RestDataSource::new(config.api_url.clone())?,
            demo: DemoDataSource::new(Arc::clone(self.session.store())),
            seen_generation: AtomicU64::new(self.session.generation()),
            session: self.session,
            resolver: FallbackResolver::new(Arc::clone(&cache)),
            cache,
            last_good: DashMap::new(),
            broadcast: BroadcastSync::new(hub),
            changefeed,
            events,
            echoes: Arc::new(EchoLedger::new(config.echo_window)),
            listeners: Mutex::new(Vec::new()),
            config,
        });
        access.attach_broadcast();
        Ok(access)
    }
}

/// Data access for one tab.
pub struct DataAccess {
    config: SyncConfig,
    session: Arc<SessionContext>,
    seen_generation: AtomicU64,
    resolver: FallbackResolver,
    cache: Arc<CacheStore>,
    /// Last value fetched live per cache key; the real-mode fallback.
    last_good: DashMap<String, serde_json::Value>,
    rest: RestDataSource,
    demo: DemoDataSource,
    broadcast: BroadcastSync,
    changefeed: ChangeSubscriptionManager,
    events: broadcast::Sender<DataEvent>,
    echoes: Arc<EchoLedger>,
    listeners: Mutex<Vec<MessageListener>>,
}

impl fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAccess")
            .field("tab_id", &self.broadcast.tab_id())
            .field("cached", &self.cache.len())
            .field("changefeed", &self.changefeed)
            .finish()
    }
}

impl DataAccess {
    pub fn builder(config: SyncConfig, session: Arc<SessionContext>) -> DataAccessBuilder {
        DataAccessBuilder {
            config,
            session,
            hub: None,
            transport: None,
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Observe data events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.events.subscribe()
    }

    /// Listen for other tabs' mutations on every table. Idempotent.
    fn attach_broadcast(&self) {
        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !listeners.is_empty() {
            return;
        }

        for kind in EntityKind::ALL {
            let cache = Arc::clone(&self.cache);
            let events = self.events.clone();
            let listener = self
                .broadcast
                .on_message(&kind.channel_name(), move |incoming| {
                    cache.invalidate(&table_prefix(kind));
                    let event = match incoming {
                        Incoming::Message(message) => {
                            trace!(%kind, action = %message.action, "remote change");
                            DataEvent::Changed {
                                kind,
                                action: message.action,
                                id: message.record_id().map(String::from),
                                origin: ChangeOrigin::Remote,
                            }
                        }
                        Incoming::Missed(_) => DataEvent::Refresh { kind },
                    };
                    let _ = events.send(event);
                });
            listeners.push(listener);
        }
        debug!(tab = %self.broadcast.tab_id(), "attached to broadcast channels");
    }

    /// Subscribe to backend changes for `kind`.
    ///
    /// Returns `None` when signed out or in demo mode, where there is no
    /// backend to listen to.
    pub async fn watch(
        &self,
        kind: EntityKind,
        filter: Option<ListFilter>,
    ) -> Option<Subscription> {
        let session = self.session_state().await;
        match session {
            SessionState::Real { .. } => {}
            SessionState::Demo { .. } => {
                debug!(%kind, "demo mode, not opening changefeed");
                return None;
            }
            SessionState::SignedOut => {
                let _ = self.events.send(DataEvent::SignInRequired);
                return None;
            }
        }

        let cache = Arc::clone(&self.cache);
        let events = self.events.clone();
        let echoes = Arc::clone(&self.echoes);
        Some(self.changefeed.subscribe(kind.table(), filter, move |event| {
            cache.invalidate(&table_prefix(kind));
            let id = event.record_id();
            if id.is_some_and(|id| echoes.is_echo(kind, id)) {
                trace!(%kind, id, "suppressing changefeed echo of local write");
                return;
            }
            let _ = events.send(DataEvent::Changed {
                kind,
                action: event.kind.into(),
                id: id.map(String::from),
                origin: ChangeOrigin::Changefeed,
            });
        }))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn list<E: Entity>(&self, filter: Option<&ListFilter>) -> Vec<E> {
        self.list_resolved(filter).await.value
    }

    /// List rows, reporting where they came from.
    pub async fn list_resolved<E: Entity>(&self, filter: Option<&ListFilter>) -> Resolved<Vec<E>> {
        let session = self.session_state().await;
        let Some(scope) = session.scope() else {
            return self.signed_out(Vec::new());
        };
        let mode = session.mode();
        let key = list_key(E::KIND, &scope.account, filter);
        let epoch = self.cache.epoch();

        let resolved = self
            .resolver
            .resolve_or_else(
                &key,
                || self.rest.list::<E>(&scope, filter),
                |failure| match mode {
                    Mode::Demo => self.demo.list_rows::<E>(&scope, filter),
                    Mode::Real if is_auth(failure) => self.rejected(Vec::new()),
                    Mode::Real => self.last_known_good(&key).unwrap_or_default(),
                },
                self.options(mode),
            )
            .await;
        self.remember(&key, &resolved, epoch);
        resolved
    }

    pub async fn get<E: Entity>(&self, id: &str) -> Option<E> {
        self.get_resolved(id).await.value
    }

    /// Fetch one row, reporting where it came from.
    pub async fn get_resolved<E: Entity>(&self, id: &str) -> Resolved<Option<E>> {
        let session = self.session_state().await;
        let Some(scope) = session.scope() else {
            return self.signed_out(None);
        };
        let mode = session.mode();
        let key = item_key(E::KIND, &scope.account, id);
        let epoch = self.cache.epoch();

        let resolved = self
            .resolver
            .resolve_or_else(
                &key,
                || self.rest.get::<E>(&scope, id),
                |failure| match mode {
                    Mode::Demo => self.demo.find_row::<E>(&scope, id),
                    Mode::Real if is_auth(failure) => self.rejected(None),
                    Mode::Real => self.last_known_good::<Option<E>>(&key).flatten(),
                },
                self.options(mode),
            )
            .await;
        self.remember(&key, &resolved, epoch);
        resolved
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn add<E: Entity>(&self, draft: E::Draft) -> Result<E, SyncError> {
        validation::validate(&draft, ValidationMode::Create)?;
        let (scope, mode) = self.require_scope().await?;

        let created = self
            .deadline(self.backend(mode).add::<E>(&scope, draft))
            .await?;
        self.commit(E::KIND, Action::Create, created.id(), row_data(&created));
        Ok(created)
    }

    pub async fn update<E: Entity>(&self, id: &str, draft: E::Draft) -> Result<E, SyncError> {
        validation::validate(&draft, ValidationMode::Update)?;
        let (scope, mode) = self.require_scope().await?;

        let updated = self
            .deadline(self.backend(mode).update::<E>(&scope, id, draft))
            .await?;
        self.commit(E::KIND, Action::Update, updated.id(), row_data(&updated));
        Ok(updated)
    }

    /// Delete a row. Deleting a row that does not exist succeeds.
    pub async fn delete<E: Entity>(&self, id: &str) -> Result<(), SyncError> {
        let (scope, mode) = self.require_scope().await?;

        let removed = self
            .deadline(self.backend(mode).delete::<E>(&scope, id))
            .await?;
        if removed {
            self.commit(
                E::KIND,
                Action::Delete,
                id,
                serde_json::json!({ "id": id }),
            );
        } else {
            debug!(kind = %E::KIND, id, "delete of absent row, nothing to do");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-entity shorthands
    // ------------------------------------------------------------------

    pub async fn get_players(&self, filter: Option<&ListFilter>) -> Vec<Player> {
        self.list(filter).await
    }

    pub async fn get_player(&self, id: &str) -> Option<Player> {
        self.get(id).await
    }

    pub async fn add_player(&self, draft: PlayerDraft) -> Result<Player, SyncError> {
        self.add::<Player>(draft).await
    }

    pub async fn update_player(&self, id: &str, draft: PlayerDraft) -> Result<Player, SyncError> {
        self.update::<Player>(id, draft).await
    }

    pub async fn delete_player(&self, id: &str) -> Result<(), SyncError> {
        self.delete::<Player>(id).await
    }

    pub async fn get_teams(&self) -> Vec<Team> {
        self.list(None).await
    }

    pub async fn add_team(&self, draft: TeamDraft) -> Result<Team, SyncError> {
        self.add::<Team>(draft).await
    }

    pub async fn update_team(&self, id: &str, draft: TeamDraft) -> Result<Team, SyncError> {
        self.update::<Team>(id, draft).await
    }

    pub async fn delete_team(&self, id: &str) -> Result<(), SyncError> {
        self.delete::<Team>(id).await
    }

    pub async fn get_matches(&self, filter: Option<&ListFilter>) -> Vec<Match> {
        self.list(filter).await
    }

    pub async fn add_match(&self, draft: MatchDraft) -> Result<Match, SyncError> {
        self.add::<Match>(draft).await
    }

    pub async fn update_match(&self, id: &str, draft: MatchDraft) -> Result<Match, SyncError> {
        self.update::<Match>(id, draft).await
    }

    pub async fn delete_match(&self, id: &str) -> Result<(), SyncError> {
        self.delete::<Match>(id).await
    }

    pub async fn get_attendance(&self, filter: Option<&ListFilter>) -> Vec<AttendanceRecord> {
        self.list(filter).await
    }

    /// The account's club profile, if one exists.
    pub async fn get_club_data(&self) -> Option<ClubData> {
        self.list::<ClubData>(None).await.into_iter().next()
    }

    pub async fn update_club_data(
        &self,
        id: &str,
        draft: ClubDataDraft,
    ) -> Result<ClubData, SyncError> {
        self.update::<ClubData>(id, draft).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Current session, dropping account-scoped state if it changed since
    /// the last call.
    async fn session_state(&self) -> SessionState {
        let (generation, state) = self.session.snapshot().await;
        let previous = self.seen_generation.swap(generation, Ordering::SeqCst);
        if previous != generation {
            self.cache.clear();
            self.last_good.clear();
            info!(mode = ?state.mode(), "session changed, dropped cached data");
        }
        state
    }

    async fn require_scope(&self) -> Result<(Scope, Mode), SyncError> {
        let session = self.session_state().await;
        match session.scope() {
            Some(scope) => Ok((scope, session.mode())),
            None => {
                let _ = self.events.send(DataEvent::SignInRequired);
                Err(SyncError::Auth("sign in to make changes".into()))
            }
        }
    }

    fn signed_out<T>(&self, value: T) -> Resolved<T> {
        debug!("signed out, serving empty value");
        let _ = self.events.send(DataEvent::SignInRequired);
        Resolved {
            value,
            origin: Origin::Fallback,
        }
    }

    /// The backend refused the token: fail closed instead of serving
    /// last-known-good rows.
    fn rejected<T>(&self, value: T) -> T {
        warn!("backend rejected credentials, serving empty value");
        self.last_good.clear();
        let _ = self.events.send(DataEvent::SignInRequired);
        value
    }

    fn backend(&self, mode: Mode) -> Backend<'_> {
        match mode {
            Mode::Real => Backend::Real(&self.rest),
            Mode::Demo => Backend::Demo(&self.demo),
        }
    }

    fn options(&self, mode: Mode) -> ResolveOptions {
        ResolveOptions {
            timeout: self.config.fetch_timeout,
            mode,
        }
    }

    async fn deadline<T>(
        &self,
        call: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        let timeout = self.config.fetch_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout)),
        }
    }

    fn last_known_good<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.last_good.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(value) => {
                debug!(key, "serving last known good value");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "last known good value does not decode");
                None
            }
        }
    }

    /// Keep a live value as the key's fallback, unless the cache was
    /// invalidated while it was being fetched.
    fn remember<T: Serialize>(&self, key: &str, resolved: &Resolved<T>, epoch: u64) {
        if resolved.origin != Origin::Live || self.cache.epoch() != epoch {
            return;
        }
        if let Ok(value) = serde_json::to_value(&resolved.value) {
            self.last_good.insert(key.to_string(), value);
        }
    }

    /// Runs with no await point between steps.
    fn commit(&self, kind: EntityKind, action: Action, id: &str, data: serde_json::Value) {
        let invalidated = self.cache.invalidate(&table_prefix(kind));
        self.echoes.record(kind, id);
        let _ = self.events.send(DataEvent::Changed {
            kind,
            action,
            id: Some(id.to_string()),
            origin: ChangeOrigin::Local,
        });
        self.broadcast
            .publish(&kind.channel_name(), BroadcastMessage::new(action, kind, data));
        debug!(%kind, %action, id, invalidated, "mutation committed");
    }
}

fn is_auth(failure: Option<&SyncError>) -> bool {
    failure.is_some_and(|e| e.class() == ErrorClass::Auth)
}

fn row_data<E: Entity>(row: &E) -> serde_json::Value {
    serde_json::to_value(row).unwrap_or_else(|_| serde_json::json!({ "id": row.id() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys() {
        assert_eq!(list_key(EntityKind::Player, "a1", None), "players_a1:all");
        assert_eq!(
            list_key(
                EntityKind::Player,
                "a1",
                Some(&ListFilter::new("team_id", "T1"))
            ),
            "players_a1:team_id=T1"
        );
        assert_eq!(item_key(EntityKind::Team, "a1", "t9"), "teams_a1:id=t9");
        assert!(
            list_key(EntityKind::Match, "a1", None).starts_with(&table_prefix(EntityKind::Match))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_ledger_window() {
        let ledger = EchoLedger::new(Duration::from_secs(2));
        ledger.record(EntityKind::Player, "p1");

        assert!(ledger.is_echo(EntityKind::Player, "p1"));
        assert!(!ledger.is_echo(EntityKind::Team, "p1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!ledger.is_echo(EntityKind::Player, "p1"));
    }

    #[test]
    fn test_change_kind_maps_to_action() {
        assert_eq!(Action::from(ChangeKind::Insert), Action::Create);
        assert_eq!(Action::from(ChangeKind::Delete), Action::Delete);
    }
}
