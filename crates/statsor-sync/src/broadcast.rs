//! Cross-tab notification bus.
//!
//! A [`BroadcastHub`] stands in for the browser's named broadcast channels:
//! every client ("tab") sharing a hub can publish to and listen on a channel
//! name. Delivery is best-effort and never reaches the publishing tab.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::model::EntityKind;

/// Default per-channel buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

/// A mutation notice sent to other tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub action: Action,
    pub entity: EntityKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    pub fn new(action: Action, entity: EntityKind, data: serde_json::Value) -> Self {
        Self {
            action,
            entity,
            data,
            timestamp: Utc::now(),
        }
    }

    /// The `id` carried in `data`, if any.
    pub fn record_id(&self) -> Option<&str> {
        self.data.get("id").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    origin: Uuid,
    message: BroadcastMessage,
}

/// What a listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(BroadcastMessage),
    /// The listener fell behind and this many messages were dropped.
    Missed(u64),
}

/// Named channels shared by every tab of one client.
#[derive(Debug)]
pub struct BroadcastHub {
    channels: DashMap<String, broadcast::Sender<Delivery>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        })
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Delivery> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// One tab's handle on the hub.
#[derive(Debug, Clone)]
pub struct BroadcastSync {
    hub: Arc<BroadcastHub>,
    tab_id: Uuid,
}

impl BroadcastSync {
    /// Join `hub` as a new tab.
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self {
            hub,
            tab_id: Uuid::new_v4(),
        }
    }

    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    /// Fire-and-forget publish to every other tab listening on `channel`.
    pub fn publish(&self, channel: &str, message: BroadcastMessage) {
        let delivery = Delivery {
            origin: self.tab_id,
            message,
        };
        match self.hub.sender(channel).send(delivery) {
            Ok(receivers) => trace!(channel, receivers, "broadcast published"),
            Err(_) => trace!(channel, "broadcast published with no listeners"),
        }
    }

    /// Listen on `channel`. Messages published by this tab are skipped.
    ///
    /// The listener is registered before this returns, so anything published
    /// afterwards is delivered. Must be called from within a tokio runtime.
    pub fn on_message<H>(&self, channel: &str, handler: H) -> MessageListener
    where
        H: Fn(Incoming) + Send + Sync + 'static,
    {
        let mut rx = self.hub.sender(channel).subscribe();
        let tab_id = self.tab_id;
        let name = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(delivery) if delivery.origin == tab_id => {}
                    Ok(delivery) => handler(Incoming::Message(delivery.message)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(channel = %name, missed, "broadcast listener lagged");
                        handler(Incoming::Missed(missed));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(channel = %name, "broadcast listener finished");
        });

        MessageListener {
            channel: channel.to_string(),
            task,
        }
    }
}

/// A registered listener; dropping it unsubscribes.
#[derive(Debug)]
pub struct MessageListener {
    channel: String,
    task: JoinHandle<()>,
}

impl MessageListener {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(self) {}
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
