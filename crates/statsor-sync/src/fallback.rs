//! Live / cached / fallback resolution for reads.
//!
//! Resolution order:
//! 1. Demo mode: the fallback, without touching the network
//! 2. A fresh cache entry
//! 3. The live fetch, raced against a deadline; success is cached
//! 4. On failure or timeout, the fallback (never cached)
//!
//! Concurrent misses for one key are not coalesced; each caller races its
//! own fetch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::error::SyncError;
use crate::session::Mode;

/// Default deadline for a live fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call resolution options.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub timeout: Duration,
    pub mode: Mode,
}

impl ResolveOptions {
    pub fn real(timeout: Duration) -> Self {
        Self {
            timeout,
            mode: Mode::Real,
        }
    }

    pub fn demo() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            mode: Mode::Demo,
        }
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Fresh from the live endpoint.
    Live,
    /// Served from the TTL cache.
    Cache,
    /// Demo data, last-known-good data or the canned default.
    Fallback,
}

/// A resolved value with its origin.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Resolved<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        Resolved {
            value: f(self.value),
            origin: self.origin,
        }
    }
}

/// Picks between live, cached and fallback values.
#[derive(Debug, Clone)]
pub struct FallbackResolver {
    cache: Arc<CacheStore>,
}

impl FallbackResolver {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Resolve a value for `key`.
    pub async fn resolve<T, F, Fut, B>(
        &self,
        key: &str,
        live_fetch: F,
        fallback: B,
        opts: ResolveOptions,
    ) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        B: FnOnce() -> T,
    {
        self.resolve_traced(key, live_fetch, fallback, opts)
            .await
            .value
    }

    /// Like [`resolve`](Self::resolve), but also reports the origin.
    pub async fn resolve_traced<T, F, Fut, B>(
        &self,
        key: &str,
        live_fetch: F,
        fallback: B,
        opts: ResolveOptions,
    ) -> Resolved<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        B: FnOnce() -> T,
    {
        self.resolve_or_else(key, live_fetch, |_| fallback(), opts)
            .await
    }

    /// Like [`resolve_traced`](Self::resolve_traced), but the fallback sees
    /// why the live path was skipped: `None` in demo mode, otherwise the
    /// fetch error.
    pub async fn resolve_or_else<T, F, Fut, B>(
        &self,
        key: &str,
        live_fetch: F,
        fallback: B,
        opts: ResolveOptions,
    ) -> Resolved<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        B: FnOnce(Option<&SyncError>) -> T,
    {
        if opts.mode == Mode::Demo {
            debug!(key, "demo mode, serving fallback");
            return Resolved {
                value: fallback(None),
                origin: Origin::Fallback,
            };
        }

        if let Some(cached) = self.cache.get(key) {
            match serde_json::from_value::<T>(cached) {
                Ok(value) => {
                    debug!(key, "cache hit");
                    return Resolved {
                        value,
                        origin: Origin::Cache,
                    };
                }
                Err(e) => {
                    // Shape changed under the same key; drop it and go live.
                    warn!(key, error = %e, "discarding undecodable cache entry");
                    self.cache.remove(key);
                }
            }
        }

        let timeout_ms = opts.timeout.as_millis() as u64;
        debug!(key, timeout_ms, "cache miss, fetching live");
        let epoch = self.cache.epoch();

        // Dropping the future on timeout abandons it; a late response is
        // never observed, so it can never be cached.
        let outcome = match tokio::time::timeout(opts.timeout, live_fetch()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(opts.timeout)),
        };

        match outcome {
            Ok(value) => {
                match serde_json::to_value(&value) {
                    Ok(json) => {
                        if !self.cache.set_if_unchanged(key, json, epoch) {
                            debug!(key, "invalidated during fetch, not caching");
                        }
                    }
                    Err(e) => warn!(key, error = %e, "live value not cacheable"),
                }
                Resolved {
                    value,
                    origin: Origin::Live,
                }
            }
            Err(e) => {
                warn!(key, error = %e, class = ?e.class(), "live fetch failed, serving fallback");
                Resolved {
                    value: fallback(Some(&e)),
                    origin: Origin::Fallback,
                }
            }
        }
    }
}
