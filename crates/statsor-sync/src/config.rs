//! Runtime configuration for the sync core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_TTL;
use crate::error::SyncError;
use crate::fallback::DEFAULT_FETCH_TIMEOUT;

const MIN_CACHE_TTL: Duration = Duration::from_secs(1);
const MAX_CACHE_TTL: Duration = Duration::from_secs(600);
const MIN_FETCH_TIMEOUT: Duration = Duration::from_millis(50);
/// Live deadlines stay under ten seconds.
const MAX_FETCH_TIMEOUT: Duration = Duration::from_secs(9);
const MAX_BROADCAST_CAPACITY: usize = 65_536;

/// Default capacity of the per-client event and cross-tab channels.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;
/// Default window in which a changefeed event for a row this client just
/// wrote is treated as an echo.
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// REST API base URL.
    pub api_url: String,
    /// Changefeed WebSocket URL.
    pub changefeed_url: String,
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    pub broadcast_capacity: usize,
    pub echo_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3001/api".to_string(),
            changefeed_url: "ws://localhost:3001/realtime".to_string(),
            cache_ttl: DEFAULT_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            echo_window: DEFAULT_ECHO_WINDOW,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Check every value against its bounds.
    pub fn validate(&self) -> Result<(), SyncError> {
        for (name, url) in [("api_url", &self.api_url), ("changefeed_url", &self.changefeed_url)] {
            if reqwest::Url::parse(url).is_err() {
                return Err(SyncError::InvalidConfig(format!(
                    "{name} is not a valid URL (got '{url}')"
                )));
            }
        }

        if !(MIN_CACHE_TTL..=MAX_CACHE_TTL).contains(&self.cache_ttl) {
            return Err(SyncError::InvalidConfig(format!(
                "cache TTL must be between {}s and {}s (got {}ms)",
                MIN_CACHE_TTL.as_secs(),
                MAX_CACHE_TTL.as_secs(),
                self.cache_ttl.as_millis()
            )));
        }

        if !(MIN_FETCH_TIMEOUT..=MAX_FETCH_TIMEOUT).contains(&self.fetch_timeout) {
            return Err(SyncError::InvalidConfig(format!(
                "fetch timeout must be between {}ms and {}ms (got {}ms)",
                MIN_FETCH_TIMEOUT.as_millis(),
                MAX_FETCH_TIMEOUT.as_millis(),
                self.fetch_timeout.as_millis()
            )));
        }

        if self.broadcast_capacity == 0 || self.broadcast_capacity > MAX_BROADCAST_CAPACITY {
            return Err(SyncError::InvalidConfig(format!(
                "broadcast capacity must be between 1 and {MAX_BROADCAST_CAPACITY} (got {})",
                self.broadcast_capacity
            )));
        }

        Ok(())
    }
}

/// Fluent builder for [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn changefeed_url(mut self, url: impl Into<String>) -> Self {
        self.config.changefeed_url = url.into();
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.broadcast_capacity = capacity;
        self
    }

    pub fn echo_window(mut self, window: Duration) -> Self {
        self.config.echo_window = window;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<SyncConfig, SyncError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test_case(Duration::from_millis(10), false; "below minimum")]
    #[test_case(Duration::from_millis(50), true; "minimum")]
    #[test_case(Duration::from_secs(9), true; "maximum")]
    #[test_case(Duration::from_secs(10), false; "ten seconds")]
    fn test_fetch_timeout_bounds(timeout: Duration, ok: bool) {
        let result = SyncConfig::builder().fetch_timeout(timeout).build();
        assert_eq!(result.is_ok(), ok);
    }

    #[test]
    fn test_cache_ttl_bounds() {
        assert!(SyncConfig::builder().cache_ttl(Duration::ZERO).build().is_err());
        assert!(SyncConfig::builder()
            .cache_ttl(Duration::from_secs(3600))
            .build()
            .is_err());
    }

    #[test]
    fn test_rejects_bad_url() {
        let err = SyncConfig::builder().api_url("not a url").build().unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(ref m) if m.contains("api_url")));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(SyncConfig::builder().broadcast_capacity(0).build().is_err());
    }
}
