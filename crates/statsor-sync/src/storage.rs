//! Typed, versioned persisted store.
//!
//! Records are written as `{"version": N, "data": ...}` under fixed keys.
//! On read:
//! - absent key: uninitialised (`None`), callers build defaults
//! - current version: decoded as-is
//! - older version or a bare legacy object: decoded, then rewritten at the
//!   current version
//! - newer version or undecodable: logged and treated as uninitialised

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::demo::DemoDataset;
use crate::error::SyncError;
use crate::session::Mode;

/// Session identity and mode.
pub const SESSION_KEY: &str = "statsor_user";
/// The demo account's dataset.
pub const DEMO_DATA_KEY: &str = "demo_account_data";
/// Prefix for per-table demo caches written by older clients.
pub const DEMO_CACHE_PREFIX: &str = "demo_cache_";
/// Current record schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Raw string storage underneath [`PersistedStore`].
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError>;

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;

    fn remove(&self, key: &str) -> Result<(), SyncError>;

    fn keys(&self) -> Result<Vec<String>, SyncError>;
}

/// Volatile store, for tests and single-process demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            SyncError::Storage(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SyncError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SyncError::Storage(format!("invalid storage key: {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let path = self.path_for(key)?;
        // Write-then-rename so a crash never leaves a torn record.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, SyncError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

/// Persisted session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(alias = "id")]
    pub account_id: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    version: u32,
    data: &'a T,
}

/// Typed access to the persisted keys.
#[derive(Debug)]
pub struct PersistedStore {
    backend: Arc<dyn KeyValueStore>,
    /// Serializes read-modify-write of the demo dataset within the process.
    demo_lock: Mutex<()>,
}

impl PersistedStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            demo_lock: Mutex::new(()),
        })
    }

    /// In-memory store.
    pub fn in_memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Read a versioned record, migrating older layouts in place.
    pub fn read<T: Serialize + DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "failed to read persisted record");
                return None;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "persisted record is not JSON, ignoring");
                return None;
            }
        };

        let (version, data) = match value {
            serde_json::Value::Object(mut map)
                if map.contains_key("version") && map.contains_key("data") =>
            {
                let version = map
                    .get("version")
                    .and_then(|v| v.as_u64())
                    .and_then(|v| u32::try_from(v).ok());
                let data = map.remove("data").unwrap_or_default();
                match version {
                    Some(v) => (v, data),
                    None => {
                        warn!(key, "persisted record has a malformed version, ignoring");
                        return None;
                    }
                }
            }
            // Unversioned layout from before the envelope existed.
            other => (0, other),
        };

        if version > SCHEMA_VERSION {
            warn!(
                key,
                version,
                supported = SCHEMA_VERSION,
                "persisted record is from a newer client, ignoring"
            );
            return None;
        }

        let record: T = match serde_json::from_value(data) {
            Ok(record) => record,
            Err(e) => {
                warn!(key, version, error = %e, "persisted record does not decode, ignoring");
                return None;
            }
        };

        if version < SCHEMA_VERSION {
            info!(key, from = version, to = SCHEMA_VERSION, "migrating persisted record");
            if let Err(e) = self.write(key, &record) {
                warn!(key, error = %e, "failed to rewrite migrated record");
            }
        }

        Some(record)
    }

    /// Write a record at the current schema version.
    pub fn write<T: Serialize>(&self, key: &str, record: &T) -> Result<(), SyncError> {
        let json = serde_json::to_string(&VersionedRef {
            version: SCHEMA_VERSION,
            data: record,
        })?;
        self.backend.set(key, &json)?;
        debug!(key, bytes = json.len(), "persisted record");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.backend.remove(key)
    }

    pub fn load_session(&self) -> Option<SessionRecord> {
        self.read(SESSION_KEY)
    }

    pub fn save_session(&self, record: &SessionRecord) -> Result<(), SyncError> {
        self.write(SESSION_KEY, record)
    }

    pub fn clear_session(&self) -> Result<(), SyncError> {
        self.remove(SESSION_KEY)
    }

    pub fn load_demo_data(&self) -> Option<DemoDataset> {
        self.read(DEMO_DATA_KEY)
    }

    pub fn save_demo_data(&self, data: &DemoDataset) -> Result<(), SyncError> {
        self.write(DEMO_DATA_KEY, data)
    }

    /// Load the demo dataset, seeding it for `account` when uninitialised.
    pub fn demo_data_or_seed(&self, account: &str) -> Result<DemoDataset, SyncError> {
        let _guard = self.lock_demo()?;
        self.demo_data_or_seed_locked(account)
    }

    fn demo_data_or_seed_locked(&self, account: &str) -> Result<DemoDataset, SyncError> {
        if let Some(data) = self.load_demo_data() {
            return Ok(data);
        }
        let data = DemoDataset::seeded(account);
        self.save_demo_data(&data)?;
        info!(account, "seeded demo dataset");
        Ok(data)
    }

    /// Read-modify-write the demo dataset under the in-process lock.
    pub fn update_demo_data<R>(
        &self,
        account: &str,
        f: impl FnOnce(&mut DemoDataset) -> R,
    ) -> Result<R, SyncError> {
        let _guard = self.lock_demo()?;
        let mut data = self.demo_data_or_seed_locked(account)?;
        let result = f(&mut data);
        self.save_demo_data(&data)?;
        Ok(result)
    }

    /// Remove every demo artifact: the dataset and any per-table caches.
    pub fn purge_demo(&self) -> Result<(), SyncError> {
        let _guard = self.lock_demo()?;
        self.backend.remove(DEMO_DATA_KEY)?;
        let mut purged = 1;
        for key in self.backend.keys()? {
            if key.starts_with(DEMO_CACHE_PREFIX) {
                self.backend.remove(&key)?;
                purged += 1;
            }
        }
        debug!(purged, "purged demo artifacts");
        Ok(())
    }

    fn lock_demo(&self) -> Result<std::sync::MutexGuard<'_, ()>, SyncError> {
        self.demo_lock
            .lock()
            .map_err(|e| SyncError::Storage(format!("demo lock poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record() -> SessionRecord {
        SessionRecord {
            account_id: "acct-1".to_string(),
            mode: Mode::Real,
            token: Some("tok".to_string()),
            email: None,
            started_at: None,
        }
    }

    #[test]
    fn test_absent_key_is_uninitialised() {
        let store = PersistedStore::in_memory();
        assert_eq!(store.load_session(), None);
        assert!(store.load_demo_data().is_none());
    }

    #[test]
    fn test_round_trip_writes_envelope() {
        let backend = Arc::new(MemoryStore::new());
        let store = PersistedStore::new(backend.clone());
        store.save_session(&record()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&backend.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(raw["version"], SCHEMA_VERSION);
        assert_eq!(raw["data"]["account_id"], "acct-1");
        assert_eq!(store.load_session(), Some(record()));
    }

    #[test]
    fn test_legacy_record_is_migrated() {
        let backend = Arc::new(MemoryStore::new());
        backend
            .set(SESSION_KEY, r#"{"id":"legacy-user","email":"a@b.co"}"#)
            .unwrap();
        let store = PersistedStore::new(backend.clone());

        let session = store.load_session().unwrap();
        assert_eq!(session.account_id, "legacy-user");
        assert_eq!(session.mode, Mode::Real);
        assert_eq!(session.email.as_deref(), Some("a@b.co"));

        let raw: serde_json::Value =
            serde_json::from_str(&backend.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(raw["version"], SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_version_is_ignored() {
        let backend = Arc::new(MemoryStore::new());
        backend
            .set(
                SESSION_KEY,
                r#"{"version":99,"data":{"account_id":"x"}}"#,
            )
            .unwrap();
        let store = PersistedStore::new(backend);
        assert_eq!(store.load_session(), None);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let backend = Arc::new(MemoryStore::new());
        backend.set(DEMO_DATA_KEY, "{not json").unwrap();
        let store = PersistedStore::new(backend);
        assert!(store.load_demo_data().is_none());
    }

    #[test]
    fn test_demo_seed_and_purge() {
        let backend = Arc::new(MemoryStore::new());
        backend.set("demo_cache_players", "[]").unwrap();
        backend.set("unrelated", "1").unwrap();
        let store = PersistedStore::new(backend.clone());

        let data = store.demo_data_or_seed("demo").unwrap();
        assert!(!data.players.is_empty());
        assert!(store.load_demo_data().is_some());

        store.purge_demo().unwrap();
        assert!(store.load_demo_data().is_none());
        assert_eq!(backend.get("demo_cache_players").unwrap(), None);
        assert_eq!(backend.get("unrelated").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_update_demo_data_persists() {
        let store = PersistedStore::in_memory();
        let before = store.demo_data_or_seed("demo").unwrap().teams.len();
        store
            .update_demo_data("demo", |data| data.teams.clear())
            .unwrap();
        assert_eq!(store.load_demo_data().unwrap().teams.len(), 0);
        assert!(before > 0);
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStore::open(dir.path().join("state")).unwrap();

        assert_eq!(files.get("statsor_user").unwrap(), None);
        files.set("statsor_user", "{}").unwrap();
        assert_eq!(files.get("statsor_user").unwrap().as_deref(), Some("{}"));
        assert_eq!(files.keys().unwrap(), vec!["statsor_user".to_string()]);

        files.remove("statsor_user").unwrap();
        files.remove("statsor_user").unwrap();
        assert_eq!(files.get("statsor_user").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            files.set("../escape", "x"),
            Err(SyncError::Storage(_))
        ));
    }
}
