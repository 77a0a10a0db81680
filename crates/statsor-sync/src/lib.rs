//! Client-side data synchronization core for Statsor.
//!
//! Sits between a UI and a REST backend for football club data (players,
//! teams, matches, club data, attendance) and keeps reads fast and available:
//!
//! - **Cache**: TTL cache with prefix invalidation, keyed `<table>_<account>:<scope>`
//! - **Fallback**: live / cached / fallback resolution with a fetch deadline
//! - **Changefeed**: reference-counted push subscriptions per `(table, filter)`
//! - **Broadcast**: cross-tab mutation notices
//! - **Facade**: [`DataAccess`], the one object callers use
//!
//! A session is either real (REST backend, bearer token) or demo (a seeded
//! local dataset that never touches the network).

pub mod broadcast;
pub mod cache;
pub mod changefeed;
mod config;
pub mod demo;
mod error;
pub mod facade;
pub mod fallback;
pub mod model;
pub mod rest;
pub mod session;
pub mod source;
pub mod storage;
pub mod validation;

pub use broadcast::{
    Action, BroadcastHub, BroadcastMessage, BroadcastSync, Incoming, MessageListener,
};
pub use cache::{CacheStore, DEFAULT_TTL};
pub use changefeed::{
    ChangeEvent, ChangeKind, ChangeSubscriptionManager, ChangefeedTransport, ChannelKey,
    ChannelStatus, Subscription, WebSocketTransport,
};
pub use config::{DEFAULT_BROADCAST_CAPACITY, DEFAULT_ECHO_WINDOW, SyncConfig, SyncConfigBuilder};
pub use demo::{DemoDataSource, DemoDataset};
pub use error::{ErrorClass, FieldError, SyncError, ValidationErrors};
pub use facade::{ChangeOrigin, DataAccess, DataAccessBuilder, DataEvent};
pub use fallback::{DEFAULT_FETCH_TIMEOUT, FallbackResolver, Origin, ResolveOptions, Resolved};
pub use model::*;
pub use rest::RestDataSource;
pub use session::{DEMO_ACCOUNT, Mode, SessionContext, SessionState};
pub use source::{DataSource, Scope};
pub use storage::{FileStore, KeyValueStore, MemoryStore, PersistedStore, SessionRecord};
pub use validation::ValidationMode;
