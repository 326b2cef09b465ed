//! TTL secret cache with stale fallback and single-flight fetching.
//!
//! Entries are bounded: inserting into a full cache evicts the oldest entry
//! by fetch time (ties broken by lexicographic path) through an auxiliary
//! ordered index, so eviction stays O(log n) regardless of cache size.
//!
//! `get_or_fetch` coalesces concurrent fetches of the same missing or
//! expired key into a single upstream call; every coalesced caller receives
//! the same outcome, success or error. When the upstream fetch fails and
//! fallback is enabled, an expired entry is served instead, flagged stale.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CacheError, ConnectionError};
use crate::proto::SecretValue;

/// Tuning knobs for the secret cache.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// TTL applied when `put` does not override it.
    pub default_ttl: Duration,
    /// Maximum number of entries before eviction kicks in.
    pub max_entries: usize,
    /// Whether expired entries may be served when upstream is unavailable.
    pub fallback_enabled: bool,
    /// How long past expiry an entry remains eligible for stale fallback.
    pub fallback_window: Duration,
    /// Cadence of the expired-entry cleanup tick.
    pub cleanup_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: 1000,
            fallback_enabled: true,
            fallback_window: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// A cache read result: the secret plus whether it was fresh at read time.
#[derive(Debug, Clone)]
pub struct CachedSecret {
    pub secret: SecretValue,
    /// `false` when served past its TTL via stale fallback.
    pub fresh: bool,
}

/// Observable cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub ttl_default_secs: u64,
    pub fallback_enabled: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    secret: SecretValue,
    fetched_at: Instant,
    expires_at: Instant,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Eviction index ordered by `(fetched_at, path)`.
    by_age: BTreeSet<(Instant, String)>,
}

type FlightResult = Result<CachedSecret, CacheError>;

/// Thread-safe TTL cache for secret values.
pub struct SecretCache {
    inner: RwLock<Inner>,
    /// Single-flight table: one broadcast channel per in-flight path.
    in_flight: StdMutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    opts: CacheOptions,
}

impl SecretCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(opts: CacheOptions) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                by_age: BTreeSet::new(),
            }),
            in_flight: StdMutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            opts,
        }
    }

    /// Look up a fresh entry.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotFound`] if no entry exists.
    /// - [`CacheError::Expired`] if the entry's TTL has elapsed.
    pub async fn get(&self, path: &str) -> Result<SecretValue, CacheError> {
        let inner = self.inner.read().await;
        match inner.entries.get(path) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::NotFound {
                    path: path.to_owned(),
                })
            }
            Some(entry) if entry.expires_at <= Instant::now() => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Expired {
                    path: path.to_owned(),
                })
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry.secret.clone())
            }
        }
    }

    /// Look up an entry, serving expired ones as stale when fallback is
    /// enabled.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotFound`] if no entry exists.
    /// - [`CacheError::Expired`] if the entry is expired and fallback is
    ///   disabled.
    pub async fn get_with_fallback(&self, path: &str) -> Result<CachedSecret, CacheError> {
        let inner = self.inner.read().await;
        match inner.entries.get(path) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::NotFound {
                    path: path.to_owned(),
                })
            }
            Some(entry) if entry.expires_at <= Instant::now() => {
                if self.opts.fallback_enabled {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(CachedSecret {
                        secret: entry.secret.clone(),
                        fresh: false,
                    })
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    Err(CacheError::Expired {
                        path: path.to_owned(),
                    })
                }
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(CachedSecret {
                    secret: entry.secret.clone(),
                    fresh: true,
                })
            }
        }
    }

    /// Insert or replace an entry. A full cache evicts its oldest entry
    /// first.
    pub async fn put(&self, path: &str, secret: SecretValue, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.opts.default_ttl);
        let mut inner = self.inner.write().await;

        if let Some(old) = inner.entries.remove(path) {
            inner.by_age.remove(&(old.fetched_at, path.to_owned()));
        } else if inner.entries.len() >= self.opts.max_entries {
            if let Some((_, victim)) = inner.by_age.pop_first() {
                inner.entries.remove(&victim);
                debug!(path = %victim, "cache full, evicted oldest entry");
            }
        }

        inner.by_age.insert((now, path.to_owned()));
        inner.entries.insert(
            path.to_owned(),
            CacheEntry {
                secret,
                fetched_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Remove an entry if present. Returns whether one was removed.
    pub async fn invalidate(&self, path: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.remove(path) {
            Some(old) => {
                inner.by_age.remove(&(old.fetched_at, path.to_owned()));
                true
            }
            None => false,
        }
    }

    /// Remove all entries.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.by_age.clear();
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        let size = self.inner.read().await.entries.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits.saturating_add(misses);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            size,
            hits,
            misses,
            hit_rate,
            ttl_default_secs: self.opts.default_ttl.as_secs(),
            fallback_enabled: self.opts.fallback_enabled,
        }
    }

    /// Fetch-through lookup with single-flight coalescing.
    ///
    /// A fresh entry is returned immediately. Otherwise exactly one caller
    /// runs `fetcher`; everyone else suspends on the same outcome. A
    /// successful fetch is inserted with the default TTL. A failed fetch
    /// falls back to an expired entry when fallback is enabled.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Expired`] when the fetch failed, an expired entry
    ///   exists, and fallback is disabled.
    /// - [`CacheError::Upstream`] when the fetch failed and no entry was
    ///   available to fall back on.
    /// - [`CacheError::Canceled`] when the fetching caller went away before
    ///   producing an outcome.
    pub async fn get_or_fetch<F, Fut>(&self, path: &str, fetcher: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SecretValue, ConnectionError>> + Send,
    {
        if let Ok(secret) = self.get(path).await {
            return Ok(CachedSecret {
                secret,
                fresh: true,
            });
        }

        // Join an in-flight fetch, or become the one running it.
        let mut rx = {
            let mut flights = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match flights.get(path) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    flights.insert(path.to_owned(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            return match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(CacheError::Canceled),
            };
        }

        // Leader path. The guard clears the flight entry if this future is
        // dropped before the outcome is broadcast, so followers fail with
        // `Canceled` instead of hanging.
        let guard = FlightGuard {
            cache: self,
            path,
            completed: false,
        };

        // Double-check: the previous leader may have filled the cache
        // between our freshness check and taking the flight slot.
        let outcome = if let Ok(secret) = self.get(path).await {
            Ok(CachedSecret {
                secret,
                fresh: true,
            })
        } else {
            match fetcher().await {
                Ok(secret) => {
                    self.put(path, secret.clone(), None).await;
                    Ok(CachedSecret {
                        secret,
                        fresh: true,
                    })
                }
                Err(err) => self.fallback_after_failed_fetch(path, err).await,
            }
        };

        guard.finish(&outcome);
        outcome
    }

    /// Resolve a failed fetch against whatever the cache still holds.
    async fn fallback_after_failed_fetch(
        &self,
        path: &str,
        err: ConnectionError,
    ) -> FlightResult {
        let now = Instant::now();
        let inner = self.inner.read().await;
        match inner.entries.get(path) {
            // A concurrent put may have landed while the fetch was failing.
            Some(entry) if entry.expires_at > now => Ok(CachedSecret {
                secret: entry.secret.clone(),
                fresh: true,
            }),
            Some(entry) if self.opts.fallback_enabled => {
                warn!(path = %path, error = %err, "upstream fetch failed, serving stale entry");
                Ok(CachedSecret {
                    secret: entry.secret.clone(),
                    fresh: false,
                })
            }
            Some(_) => Err(CacheError::Expired {
                path: path.to_owned(),
            }),
            None => Err(CacheError::Upstream {
                source: Arc::new(err),
            }),
        }
    }

    /// Remove entries past their TTL plus the fallback grace window.
    /// Returns how many were removed.
    pub async fn remove_expired(&self) -> usize {
        let grace = if self.opts.fallback_enabled {
            self.opts.fallback_window
        } else {
            Duration::ZERO
        };
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at + grace <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &doomed {
            if let Some(old) = inner.entries.remove(path) {
                inner.by_age.remove(&(old.fetched_at, path.clone()));
            }
        }
        doomed.len()
    }

    /// Periodic cleanup tick. Runs until the shutdown signal flips.
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.opts.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.remove_expired().await;
                    if removed > 0 {
                        debug!(removed, "cache cleanup removed expired entries");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("cache cleanup stopping");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCache").finish_non_exhaustive()
    }
}

/// Clears the single-flight slot for `path`, broadcasting the outcome on a
/// clean finish and closing the channel on abandonment.
struct FlightGuard<'a> {
    cache: &'a SecretCache,
    path: &'a str,
    completed: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, outcome: &FlightResult) {
        let tx = {
            let mut flights = self
                .cache
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            flights.remove(self.path)
        };
        if let Some(tx) = tx {
            let _ = tx.send(outcome.clone());
        }
        self.completed = true;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let mut flights = self
                .cache
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            flights.remove(self.path);
        }
    }
}
