//! Reference-counted changefeed subscriptions.
//!
//! Callers subscribing to the same `(table, filter)` share one underlying
//! channel. The channel opens on the first subscription and is torn down
//! (exactly once) when the last one goes away. Events fan out to every
//! listener in subscription order.
//!
//! Opening a channel is not retried. A failure, or the stream ending, is
//! reported once through the status callback and the subscribers simply
//! receive no events. The next `subscribe` on that key opens the channel
//! again, and its events reach every listener still registered.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::error::SyncError;
use crate::model::ListFilter;
use crate::session::{SessionContext, SessionState};

/// Identity of one shared channel: a table plus an optional equality filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub table: String,
    pub filter: Option<ListFilter>,
}

impl ChannelKey {
    pub fn new(table: impl Into<String>, filter: Option<ListFilter>) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}:{}", self.table, filter),
            None => write!(f, "{}:all", self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

/// A row-level change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType", alias = "event_type")]
    pub kind: ChangeKind,
    pub table: String,
    /// New row for inserts/updates, old row for deletes.
    #[serde(default, alias = "new")]
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn record_id(&self) -> Option<&str> {
        self.record.get("id").and_then(|v| v.as_str())
    }
}

/// Lifecycle of one shared channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Error(String),
    Closed,
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

pub type StatusCallback = Arc<dyn Fn(&ChannelKey, &ChannelStatus) + Send + Sync>;

/// Something that can open a change stream for a channel key.
#[async_trait]
pub trait ChangefeedTransport: Send + Sync + 'static {
    /// Open the stream. The returned receiver ends when the stream does.
    async fn open(&self, key: &ChannelKey) -> Result<mpsc::Receiver<ChangeEvent>, SyncError>;

    /// Release whatever `open` acquired for `key`.
    fn close(&self, key: &ChannelKey);
}

struct ChannelEntry {
    listeners: Vec<(u64, ChangeCallback)>,
    pump: JoinHandle<()>,
    /// Identifies the pump serving this entry.
    instance: u64,
    /// The pump has exited.
    ended: bool,
}

struct Inner {
    transport: Arc<dyn ChangefeedTransport>,
    channels: DashMap<ChannelKey, ChannelEntry>,
    next_id: AtomicU64,
    status: Option<StatusCallback>,
}

impl Inner {
    fn report(&self, key: &ChannelKey, status: ChannelStatus) {
        report(self.status.as_ref(), key, &status);
    }

    /// Record that the pump `instance` for `key` is gone. A pump of an
    /// entry that was torn down and recreated leaves the new one alone.
    fn mark_ended(&self, key: &ChannelKey, instance: u64) {
        if let Some(mut entry) = self.channels.get_mut(key) {
            if entry.instance == instance {
                entry.ended = true;
            }
        }
    }

    fn release(&self, key: &ChannelKey, id: u64) {
        if let Some(mut entry) = self.channels.get_mut(key) {
            entry.listeners.retain(|(listener, _)| *listener != id);
        }
        let removed = self
            .channels
            .remove_if(key, |_, entry| entry.listeners.is_empty());
        if let Some((key, entry)) = removed {
            entry.pump.abort();
            self.transport.close(&key);
            self.report(&key, ChannelStatus::Closed);
            info!(channel = %key, "changefeed channel closed");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.channels.iter() {
            entry.pump.abort();
            self.transport.close(entry.key());
        }
    }
}

fn report(callback: Option<&StatusCallback>, key: &ChannelKey, status: &ChannelStatus) {
    if let Some(callback) = callback {
        callback(key, status);
    }
}

/// Registry of shared changefeed channels.
#[derive(Clone)]
pub struct ChangeSubscriptionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ChangeSubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSubscriptionManager")
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl ChangeSubscriptionManager {
    pub fn new(transport: Arc<dyn ChangefeedTransport>) -> Self {
        Self::build(transport, None)
    }

    /// Like [`new`](Self::new), reporting channel lifecycle to `status`.
    pub fn with_status(transport: Arc<dyn ChangefeedTransport>, status: StatusCallback) -> Self {
        Self::build(transport, Some(status))
    }

    fn build(transport: Arc<dyn ChangefeedTransport>, status: Option<StatusCallback>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                channels: DashMap::new(),
                next_id: AtomicU64::new(1),
                status,
            }),
        }
    }

    /// Subscribe to changes on `table`, optionally filtered.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, table: &str, filter: Option<ListFilter>, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let key = ChannelKey::new(table, filter);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: ChangeCallback = Arc::new(callback);

        let mut entry = self.inner.channels.entry(key.clone()).or_insert_with(|| {
            info!(channel = %key, "opening changefeed channel");
            let (pump, instance) = self.spawn_pump(&key);
            ChannelEntry {
                listeners: Vec::new(),
                pump,
                instance,
                ended: false,
            }
        });
        if entry.ended {
            info!(channel = %key, "reopening changefeed channel");
            let (pump, instance) = self.spawn_pump(&key);
            entry.pump = pump;
            entry.instance = instance;
            entry.ended = false;
        }
        entry.listeners.push((id, callback));
        let listeners = entry.listeners.len();
        drop(entry);

        debug!(channel = %key, listeners, "subscribed");

        Subscription {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
            active: true,
        }
    }

    fn spawn_pump(&self, key: &ChannelKey) -> (JoinHandle<()>, u64) {
        let instance = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(pump(Arc::downgrade(&self.inner), key.clone(), instance));
        (handle, instance)
    }

    /// Number of listeners on `key`; zero when the channel is not open.
    pub fn listener_count(&self, key: &ChannelKey) -> usize {
        self.inner
            .channels
            .get(key)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }
}

/// Receives from the transport and fans out to the current listeners.
async fn pump(inner: Weak<Inner>, key: ChannelKey, instance: u64) {
    let (transport, status) = match inner.upgrade() {
        Some(inner) => (Arc::clone(&inner.transport), inner.status.clone()),
        None => return,
    };

    report(status.as_ref(), &key, &ChannelStatus::Connecting);
    let mut events = match transport.open(&key).await {
        Ok(events) => events,
        Err(e) => {
            warn!(channel = %key, error = %e, "failed to open changefeed channel");
            ended(&inner, &key, instance);
            report(status.as_ref(), &key, &ChannelStatus::Error(e.to_string()));
            return;
        }
    };
    report(status.as_ref(), &key, &ChannelStatus::Connected);

    while let Some(event) = events.recv().await {
        let listeners: Vec<ChangeCallback> = match inner.upgrade() {
            Some(inner) => match inner.channels.get(&key) {
                Some(entry) => entry.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => break,
            },
            None => break,
        };
        let count = listeners.len();
        trace!(channel = %key, kind = ?event.kind, listeners = count, "changefeed event");
        // Map guard is released before any callback runs.
        for listener in listeners {
            listener(&event);
        }
    }

    warn!(channel = %key, "changefeed stream ended");
    ended(&inner, &key, instance);
    report(
        status.as_ref(),
        &key,
        &ChannelStatus::Error("stream ended".to_string()),
    );
}

fn ended(inner: &Weak<Inner>, key: &ChannelKey, instance: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.mark_ended(key, instance);
    }
}

/// Handle for one listener. Unsubscribes on drop.
pub struct Subscription {
    inner: Weak<Inner>,
    key: ChannelKey,
    id: u64,
    active: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.release(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Changefeed over a WebSocket endpoint that streams JSON [`ChangeEvent`]s.
///
/// Each channel is its own connection, opened with `?table=<t>` and, when
/// filtered, `&filter=<column>=eq.<value>`. The bearer token goes in
/// `access_token`; with a session attached it is read at every open, so a
/// later login is picked up.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: String,
    token: Option<String>,
    session: Option<Arc<SessionContext>>,
    shutdowns: DashMap<ChannelKey, watch::Sender<bool>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            session: None,
            shutdowns: DashMap::new(),
        }
    }

    /// Authenticate with a fixed token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Authenticate with the token of the session's real sign-in, falling
    /// back to a fixed token when the session has none.
    pub fn with_session(mut self, session: Arc<SessionContext>) -> Self {
        self.session = Some(session);
        self
    }

    async fn current_token(&self) -> Option<String> {
        if let Some(session) = &self.session {
            if let SessionState::Real { token, .. } = session.current().await {
                return Some(token);
            }
        }
        self.token.clone()
    }

    fn build_url(&self, key: &ChannelKey, token: Option<&str>) -> Result<String, SyncError> {
        let mut params = vec![("table".to_string(), key.table.clone())];
        if let Some(filter) = &key.filter {
            params.push((
                "filter".to_string(),
                format!("{}=eq.{}", filter.column, filter.value),
            ));
        }
        if let Some(token) = token {
            params.push(("access_token".to_string(), token.to_string()));
        }
        let url = reqwest::Url::parse_with_params(&self.url, &params)
            .map_err(|e| SyncError::Channel(format!("invalid changefeed URL: {}", e)))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl ChangefeedTransport for WebSocketTransport {
    async fn open(&self, key: &ChannelKey) -> Result<mpsc::Receiver<ChangeEvent>, SyncError> {
        let token = self.current_token().await;
        let url = self.build_url(key, token.as_deref())?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Channel(format!("connection failed: {}", e)))?;
        let (_, mut read) = ws_stream.split();
        info!(channel = %key, "changefeed connected");

        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdowns.insert(key.clone(), shutdown_tx);

        let channel = key.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!(channel, "changefeed reader shutting down");
                            break;
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ChangeEvent>(&text) {
                                    Ok(event) => {
                                        if tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        debug!(channel, error = %e, "ignoring unparseable message");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!(channel, "changefeed closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(channel, error = %e, "changefeed read error");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn close(&self, key: &ChannelKey) {
        if let Some((_, shutdown)) = self.shutdowns.remove(key) {
            let _ = shutdown.send(true);
        }
    }
}
