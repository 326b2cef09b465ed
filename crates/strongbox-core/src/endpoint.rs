//! Endpoint health tracking and round-robin selection for the core fleet.
//!
//! The manager is a passive tracker: it never probes endpoints itself. The
//! connection supervisor reports every connect outcome and the manager
//! derives status, failure counters, and backoff windows from those
//! reports. A periodic tick clears elapsed backoffs back to `degraded`, at
//! which point the next selection may try the endpoint again — the real
//! health signal is the outcome of that attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backoff;
use crate::error::EndpointError;

/// Health status of a single core endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Recently confirmed reachable.
    Healthy,
    /// Failing or freshly out of backoff; still eligible for selection.
    Degraded,
    /// Past the failover threshold; gated by a backoff window.
    Unhealthy,
}

/// Tuning knobs for the endpoint manager.
#[derive(Debug, Clone)]
pub struct EndpointManagerOptions {
    /// Consecutive failures before an endpoint is marked unhealthy.
    pub failover_threshold: u32,
    /// Consecutive successes before an endpoint is marked healthy again.
    pub recovery_threshold: u32,
    /// Cadence of the backoff-clearing tick.
    pub health_check_interval: Duration,
}

impl Default for EndpointManagerOptions {
    fn default() -> Self {
        Self {
            failover_threshold: 3,
            recovery_threshold: 3,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct EndpointState {
    url: String,
    status: EndpointStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    backoff_until: Option<Instant>,
}

impl EndpointState {
    fn new(url: String) -> Self {
        Self {
            url,
            status: EndpointStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success: None,
            last_failure: None,
            backoff_until: None,
        }
    }

    /// Eligible for selection: healthy and degraded endpoints always are;
    /// unhealthy endpoints only once their backoff window has elapsed.
    fn eligible(&self, now: Instant) -> bool {
        match self.backoff_until {
            Some(until) => until <= now,
            None => self.status != EndpointStatus::Unhealthy,
        }
    }
}

/// Observable snapshot of one endpoint's health.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub url: String,
    pub status: EndpointStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Seconds until the backoff window elapses, if one is active.
    pub backoff_remaining_secs: Option<u64>,
}

struct Inner {
    endpoints: Vec<EndpointState>,
    cursor: usize,
}

/// Round-robin endpoint selection with health filtering.
pub struct EndpointManager {
    inner: RwLock<Inner>,
    opts: EndpointManagerOptions,
}

impl EndpointManager {
    /// Create a manager over the configured endpoint URLs. All endpoints
    /// start healthy.
    #[must_use]
    pub fn new(urls: Vec<String>, opts: EndpointManagerOptions) -> Self {
        let endpoints = urls.into_iter().map(EndpointState::new).collect();
        Self {
            inner: RwLock::new(Inner {
                endpoints,
                cursor: 0,
            }),
            opts,
        }
    }

    /// Hand out the next eligible endpoint, advancing the round-robin
    /// cursor past it.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NoHealthy`] when every endpoint is inside a
    /// backoff window; the cursor is left where it was.
    pub async fn next(&self) -> Result<String, EndpointError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let len = inner.endpoints.len();
        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            if inner.endpoints[idx].eligible(now) {
                inner.cursor = (idx + 1) % len;
                return Ok(inner.endpoints[idx].url.clone());
            }
        }
        Err(EndpointError::NoHealthy)
    }

    /// Record a successful connection to `url`.
    pub async fn report_success(&self, url: &str) {
        let mut inner = self.inner.write().await;
        let recovery = self.opts.recovery_threshold;
        if let Some(ep) = inner.endpoints.iter_mut().find(|e| e.url == url) {
            ep.consecutive_successes = ep.consecutive_successes.saturating_add(1);
            ep.consecutive_failures = 0;
            ep.backoff_until = None;
            ep.last_success = Some(Utc::now());
            if ep.consecutive_successes >= recovery {
                if ep.status != EndpointStatus::Healthy {
                    info!(endpoint = %ep.url, "endpoint recovered");
                }
                ep.status = EndpointStatus::Healthy;
            } else if ep.status == EndpointStatus::Unhealthy {
                ep.status = EndpointStatus::Degraded;
            }
        }
    }

    /// Record a failed connection to `url`. Past the failover threshold the
    /// endpoint is marked unhealthy and enters an exponential backoff
    /// window with jitter.
    pub async fn report_failure(&self, url: &str) {
        let mut inner = self.inner.write().await;
        let threshold = self.opts.failover_threshold;
        if let Some(ep) = inner.endpoints.iter_mut().find(|e| e.url == url) {
            ep.consecutive_failures = ep.consecutive_failures.saturating_add(1);
            ep.consecutive_successes = 0;
            ep.last_failure = Some(Utc::now());
            if ep.consecutive_failures >= threshold {
                let step = ep.consecutive_failures - threshold + 1;
                let delay = backoff::with_jitter(backoff::endpoint_backoff(step));
                ep.status = EndpointStatus::Unhealthy;
                ep.backoff_until = Some(Instant::now() + delay);
                info!(
                    endpoint = %ep.url,
                    failures = ep.consecutive_failures,
                    backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "endpoint marked unhealthy"
                );
            } else {
                ep.status = EndpointStatus::Degraded;
            }
        }
    }

    /// Snapshot the health of every endpoint.
    pub async fn health(&self) -> Vec<EndpointHealth> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner
            .endpoints
            .iter()
            .map(|ep| EndpointHealth {
                url: ep.url.clone(),
                status: ep.status,
                consecutive_failures: ep.consecutive_failures,
                consecutive_successes: ep.consecutive_successes,
                last_success: ep.last_success,
                last_failure: ep.last_failure,
                backoff_remaining_secs: ep
                    .backoff_until
                    .and_then(|until| until.checked_duration_since(now))
                    .map(|d| d.as_secs()),
            })
            .collect()
    }

    /// Operator override: force an endpoint healthy and clear its counters.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Unknown`] for an unconfigured URL.
    pub async fn mark_healthy(&self, url: &str) -> Result<(), EndpointError> {
        let mut inner = self.inner.write().await;
        let ep = inner
            .endpoints
            .iter_mut()
            .find(|e| e.url == url)
            .ok_or_else(|| EndpointError::Unknown {
                url: url.to_owned(),
            })?;
        ep.status = EndpointStatus::Healthy;
        ep.consecutive_failures = 0;
        ep.consecutive_successes = 0;
        ep.backoff_until = None;
        Ok(())
    }

    /// Operator override: force an endpoint out of rotation for the maximum
    /// backoff window.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Unknown`] for an unconfigured URL.
    pub async fn mark_unhealthy(&self, url: &str) -> Result<(), EndpointError> {
        let mut inner = self.inner.write().await;
        let ep = inner
            .endpoints
            .iter_mut()
            .find(|e| e.url == url)
            .ok_or_else(|| EndpointError::Unknown {
                url: url.to_owned(),
            })?;
        ep.status = EndpointStatus::Unhealthy;
        ep.consecutive_successes = 0;
        ep.backoff_until = Some(Instant::now() + Duration::from_secs(300));
        Ok(())
    }

    /// Clear every elapsed backoff window, dropping those endpoints to
    /// `degraded` so the next selection may try them. Returns how many
    /// were cleared.
    pub async fn clear_elapsed_backoffs(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let mut cleared = 0usize;
        for ep in &mut inner.endpoints {
            if let Some(until) = ep.backoff_until {
                if until <= now {
                    ep.backoff_until = None;
                    ep.status = EndpointStatus::Degraded;
                    cleared = cleared.saturating_add(1);
                    debug!(endpoint = %ep.url, "backoff elapsed, endpoint degraded");
                }
            }
        }
        cleared
    }

    /// Periodic backoff-clearing tick. Runs until the shutdown signal
    /// flips.
    pub async fn run_health_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.opts.health_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cleared = self.clear_elapsed_backoffs().await;
                    if cleared > 0 {
                        debug!(cleared, "endpoint backoffs cleared");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("endpoint health ticker stopping");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for EndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointManager").finish_non_exhaustive()
    }
}
