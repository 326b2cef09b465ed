//! Proactive renewal of dynamic-credential leases.
//!
//! Every tracked lease is evaluated on a scheduler tick: leases past their
//! expiry fire `on_expired` and vanish; leases inside the warning window
//! fire `on_expiring_soon` once; active leases with less than a third of
//! their duration remaining are dispatched for renewal, as are failed
//! leases whose retry backoff has elapsed.
//!
//! Renewals never block the scheduler — each one runs on its own task
//! through the [`LeaseClient`] seam, bounded by a semaphore. A lease in
//! status `renewing` is never dispatched twice.
//!
//! Callbacks are invoked outside the state lock; a panicking callback is
//! caught and logged, it never poisons renewer state.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff;
use crate::error::{ConnectionError, LeaseError};
use crate::proto::LeaseRenewal;

/// Issues the actual renewal calls upstream. Implemented by the connection
/// supervisor; tests substitute a stub.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Renew a lease, asking for `increment_secs` more seconds (0 lets core
    /// pick its default).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the session is down or core rejects
    /// the renewal.
    async fn renew_lease(
        &self,
        lease_id: &str,
        increment_secs: u64,
    ) -> Result<LeaseRenewal, ConnectionError>;
}

/// Lease lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    /// Healthy; renewal not yet due.
    Active,
    /// A renewal task is in flight.
    Renewing,
    /// Last renewal failed; waiting out the retry backoff.
    Failed,
    /// Reached expiry without a successful renewal.
    Expired,
}

/// Tuning knobs for the renewer.
#[derive(Debug, Clone)]
pub struct LeaseRenewerOptions {
    /// Scheduler tick cadence.
    pub check_interval: Duration,
    /// Renewal attempts before a lease is abandoned.
    pub max_retries: u32,
    /// Bound on concurrently outstanding renewal calls.
    pub max_concurrent_renewals: usize,
    /// Remaining lifetime under which `on_expiring_soon` fires.
    pub expiry_warning_window: Duration,
    /// Fraction of the lease duration under which renewal is initiated.
    pub renew_threshold: f64,
}

impl Default for LeaseRenewerOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            max_retries: 5,
            max_concurrent_renewals: 32,
            expiry_warning_window: Duration::from_secs(300),
            renew_threshold: 0.33,
        }
    }
}

/// Everything needed to start tracking a lease.
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub secret_path: String,
    pub credentials: serde_json::Value,
    pub duration_secs: u64,
    pub metadata: HashMap<String, String>,
}

/// Observable snapshot of one tracked lease.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseInfo {
    pub lease_id: String,
    pub secret_path: String,
    pub status: LeaseStatus,
    pub retry_count: u32,
    pub expires_in_secs: u64,
}

/// Renewer counters.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseStats {
    pub tracked: usize,
    pub active: usize,
    pub renewing: usize,
    pub failed: usize,
    pub renewed_total: u64,
    pub expired_total: u64,
    pub failed_total: u64,
}

/// An event handed to lease callbacks.
#[derive(Debug, Clone)]
pub struct LeaseEvent {
    pub lease_id: String,
    pub secret_path: String,
    /// Human-readable detail for failure events.
    pub detail: Option<String>,
}

/// A lease lifecycle callback.
pub type LeaseHook = Arc<dyn Fn(&LeaseEvent) + Send + Sync>;

/// Callback set supplied at construction. Absent hooks are skipped.
#[derive(Clone, Default)]
pub struct LeaseCallbacks {
    pub on_renewed: Option<LeaseHook>,
    pub on_expiring_soon: Option<LeaseHook>,
    pub on_expired: Option<LeaseHook>,
    pub on_failed: Option<LeaseHook>,
}

impl LeaseCallbacks {
    fn fire(hook: Option<&LeaseHook>, which: &'static str, event: &LeaseEvent) {
        if let Some(hook) = hook {
            let result = catch_unwind(AssertUnwindSafe(|| hook(event)));
            if result.is_err() {
                error!(
                    lease_id = %event.lease_id,
                    callback = which,
                    "lease callback panicked; state is unaffected"
                );
            }
        }
    }
}

impl std::fmt::Debug for LeaseCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCallbacks").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct LeaseState {
    secret_path: String,
    credentials: serde_json::Value,
    duration: Duration,
    expires_at: Instant,
    status: LeaseStatus,
    retry_count: u32,
    next_retry_at: Option<Instant>,
    metadata: HashMap<String, String>,
    warned_expiring: bool,
}

/// Tracks dynamic leases and keeps them renewed.
pub struct LeaseRenewer {
    leases: Mutex<HashMap<String, LeaseState>>,
    client: Arc<dyn LeaseClient>,
    callbacks: LeaseCallbacks,
    opts: LeaseRenewerOptions,
    permits: Arc<Semaphore>,
    renewed_total: AtomicU64,
    expired_total: AtomicU64,
    failed_total: AtomicU64,
}

impl LeaseRenewer {
    /// Create a renewer over the given client and callback set.
    #[must_use]
    pub fn new(
        client: Arc<dyn LeaseClient>,
        callbacks: LeaseCallbacks,
        opts: LeaseRenewerOptions,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(opts.max_concurrent_renewals));
        Self {
            leases: Mutex::new(HashMap::new()),
            client,
            callbacks,
            opts,
            permits,
            renewed_total: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    /// Begin tracking a lease. An existing lease with the same ID is
    /// replaced.
    pub async fn track(&self, lease_id: &str, request: TrackRequest) {
        let duration = Duration::from_secs(request.duration_secs);
        let state = LeaseState {
            secret_path: request.secret_path,
            credentials: request.credentials,
            duration,
            expires_at: Instant::now() + duration,
            status: LeaseStatus::Active,
            retry_count: 0,
            next_retry_at: None,
            metadata: request.metadata,
            warned_expiring: false,
        };
        info!(lease_id = %lease_id, path = %state.secret_path, duration_secs = request.duration_secs, "lease tracked");
        self.leases.lock().await.insert(lease_id.to_owned(), state);
    }

    /// Stop tracking a lease. Silent: no callback fires.
    pub async fn untrack(&self, lease_id: &str) {
        if self.leases.lock().await.remove(lease_id).is_some() {
            debug!(lease_id = %lease_id, "lease untracked");
        }
    }

    /// Snapshot one lease.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NotFound`] for an untracked ID.
    pub async fn status(&self, lease_id: &str) -> Result<LeaseInfo, LeaseError> {
        let leases = self.leases.lock().await;
        leases
            .get(lease_id)
            .map(|state| Self::info(lease_id, state))
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })
    }

    /// Snapshot every tracked lease.
    pub async fn list(&self) -> Vec<LeaseInfo> {
        let leases = self.leases.lock().await;
        leases
            .iter()
            .map(|(id, state)| Self::info(id, state))
            .collect()
    }

    /// Current counters.
    pub async fn stats(&self) -> LeaseStats {
        let leases = self.leases.lock().await;
        let mut active = 0usize;
        let mut renewing = 0usize;
        let mut failed = 0usize;
        for state in leases.values() {
            match state.status {
                LeaseStatus::Active => active += 1,
                LeaseStatus::Renewing => renewing += 1,
                LeaseStatus::Failed => failed += 1,
                LeaseStatus::Expired => {}
            }
        }
        LeaseStats {
            tracked: leases.len(),
            active,
            renewing,
            failed,
            renewed_total: self.renewed_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
        }
    }

    fn info(lease_id: &str, state: &LeaseState) -> LeaseInfo {
        LeaseInfo {
            lease_id: lease_id.to_owned(),
            secret_path: state.secret_path.clone(),
            status: state.status,
            retry_count: state.retry_count,
            expires_in_secs: state
                .expires_at
                .checked_duration_since(Instant::now())
                .map_or(0, |d| d.as_secs()),
        }
    }

    /// Evaluate every tracked lease once. Exposed so tests can drive the
    /// scheduler deterministically.
    pub async fn tick(self: &Arc<Self>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut warnings = Vec::new();
        let mut dispatch = Vec::new();

        {
            let mut leases = self.leases.lock().await;
            let mut gone = Vec::new();
            for (id, state) in leases.iter_mut() {
                if now >= state.expires_at {
                    state.status = LeaseStatus::Expired;
                    expired.push(LeaseEvent {
                        lease_id: id.clone(),
                        secret_path: state.secret_path.clone(),
                        detail: None,
                    });
                    gone.push(id.clone());
                    continue;
                }

                let remaining = state.expires_at - now;
                if remaining < self.opts.expiry_warning_window
                    && state.status != LeaseStatus::Renewing
                    && !state.warned_expiring
                {
                    state.warned_expiring = true;
                    warnings.push(LeaseEvent {
                        lease_id: id.clone(),
                        secret_path: state.secret_path.clone(),
                        detail: None,
                    });
                }

                let due = match state.status {
                    LeaseStatus::Active => {
                        remaining.as_secs_f64()
                            < state.duration.as_secs_f64() * self.opts.renew_threshold
                    }
                    LeaseStatus::Failed => {
                        state.next_retry_at.is_some_and(|at| at <= now)
                    }
                    LeaseStatus::Renewing | LeaseStatus::Expired => false,
                };
                if due {
                    state.status = LeaseStatus::Renewing;
                    dispatch.push(id.clone());
                }
            }
            for id in &gone {
                leases.remove(id);
            }
        }

        for event in &expired {
            self.expired_total.fetch_add(1, Ordering::Relaxed);
            warn!(lease_id = %event.lease_id, path = %event.secret_path, "lease expired");
            LeaseCallbacks::fire(self.callbacks.on_expired.as_ref(), "on_expired", event);
        }
        for event in &warnings {
            debug!(lease_id = %event.lease_id, "lease expiring soon");
            LeaseCallbacks::fire(
                self.callbacks.on_expiring_soon.as_ref(),
                "on_expiring_soon",
                event,
            );
        }
        for lease_id in dispatch {
            let renewer = Arc::clone(self);
            tokio::spawn(async move {
                renewer.run_renewal(lease_id).await;
            });
        }
    }

    /// One renewal attempt for a lease previously moved to `renewing`.
    async fn run_renewal(self: Arc<Self>, lease_id: String) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        // The lease may have been untracked between dispatch and now.
        let increment = {
            let leases = self.leases.lock().await;
            match leases.get(&lease_id) {
                Some(state) => state.duration.as_secs(),
                None => return,
            }
        };

        debug!(lease_id = %lease_id, increment_secs = increment, "renewing lease");
        match self.client.renew_lease(&lease_id, increment).await {
            Ok(renewal) => self.apply_renewal(&lease_id, &renewal).await,
            Err(err) if is_permanent(&err) => {
                self.abandon(&lease_id, &err.to_string()).await;
            }
            Err(err) => self.apply_transient_failure(&lease_id, &err.to_string()).await,
        }
    }

    async fn apply_renewal(&self, lease_id: &str, renewal: &LeaseRenewal) {
        let event = {
            let mut leases = self.leases.lock().await;
            let Some(state) = leases.get_mut(lease_id) else {
                return;
            };
            if renewal.lease_duration > 0 {
                state.duration = Duration::from_secs(renewal.lease_duration);
            }
            state.expires_at = Instant::now() + state.duration;
            state.status = LeaseStatus::Active;
            state.retry_count = 0;
            state.next_retry_at = None;
            state.warned_expiring = false;
            LeaseEvent {
                lease_id: lease_id.to_owned(),
                secret_path: state.secret_path.clone(),
                detail: None,
            }
        };
        self.renewed_total.fetch_add(1, Ordering::Relaxed);
        info!(lease_id = %lease_id, duration_secs = renewal.lease_duration, "lease renewed");
        LeaseCallbacks::fire(self.callbacks.on_renewed.as_ref(), "on_renewed", &event);
    }

    async fn apply_transient_failure(&self, lease_id: &str, detail: &str) {
        let abandoned = {
            let mut leases = self.leases.lock().await;
            let Some(state) = leases.get_mut(lease_id) else {
                return;
            };
            if state.retry_count + 1 >= self.opts.max_retries {
                true
            } else {
                state.retry_count += 1;
                state.status = LeaseStatus::Failed;
                let delay = backoff::with_jitter(backoff::renewal_backoff(state.retry_count));
                state.next_retry_at = Some(Instant::now() + delay);
                warn!(
                    lease_id = %lease_id,
                    retry = state.retry_count,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    detail,
                    "lease renewal failed, will retry"
                );
                false
            }
        };
        if abandoned {
            self.abandon(lease_id, detail).await;
        }
    }

    /// Permanent failure: fire `on_failed` and forget the lease.
    async fn abandon(&self, lease_id: &str, detail: &str) {
        let event = {
            let mut leases = self.leases.lock().await;
            match leases.remove(lease_id) {
                Some(state) => LeaseEvent {
                    lease_id: lease_id.to_owned(),
                    secret_path: state.secret_path,
                    detail: Some(detail.to_owned()),
                },
                None => return,
            }
        };
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        warn!(lease_id = %lease_id, detail, "lease renewal abandoned");
        LeaseCallbacks::fire(self.callbacks.on_failed.as_ref(), "on_failed", &event);
    }

    /// Scheduler loop. Runs until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.opts.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.opts.check_interval.as_secs(),
            "lease renewer started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("lease renewer stopping");
                    return;
                }
            }
        }
    }

    /// The credentials payload of a tracked lease, if still present.
    pub async fn credentials(&self, lease_id: &str) -> Option<serde_json::Value> {
        self.leases
            .lock()
            .await
            .get(lease_id)
            .map(|state| state.credentials.clone())
    }

    /// Metadata of a tracked lease, if still present.
    pub async fn metadata(&self, lease_id: &str) -> Option<HashMap<String, String>> {
        self.leases
            .lock()
            .await
            .get(lease_id)
            .map(|state| state.metadata.clone())
    }
}

impl std::fmt::Debug for LeaseRenewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRenewer").finish_non_exhaustive()
    }
}

/// Whether a renewal error is not worth retrying.
fn is_permanent(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::Server { kind, .. } => {
            matches!(kind.as_str(), "not_found" | "not_renewable" | "denied" | "permission_denied")
        }
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    /// Scripted lease client: pops the next outcome per call.
    struct ScriptedClient {
        outcomes: StdMutex<Vec<Result<LeaseRenewal, ConnectionError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedClient {
        fn new(outcomes: Vec<Result<LeaseRenewal, ConnectionError>>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LeaseClient for ScriptedClient {
        async fn renew_lease(
            &self,
            _lease_id: &str,
            _increment_secs: u64,
        ) -> Result<LeaseRenewal, ConnectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(LeaseRenewal {
                    lease_duration: 60,
                    renewable: true,
                })
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn counter_hook(counter: &Arc<AtomicUsize>) -> LeaseHook {
        let counter = Arc::clone(counter);
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn track_request(path: &str, duration_secs: u64) -> TrackRequest {
        TrackRequest {
            secret_path: path.to_owned(),
            credentials: serde_json::json!({"user": "u", "pass": "p"}),
            duration_secs,
            metadata: HashMap::new(),
        }
    }

    async fn settle() {
        // Let spawned renewal tasks run to completion under paused time.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_initiates_below_a_third_of_duration() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let renewed = Arc::new(AtomicUsize::new(0));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks {
                on_renewed: Some(counter_hook(&renewed)),
                ..LeaseCallbacks::default()
            },
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("db.creds.app", 60)).await;

        // At 30 s remaining (> 20 s threshold) nothing happens.
        tokio::time::advance(Duration::from_secs(30)).await;
        renewer.tick().await;
        settle().await;
        assert_eq!(client.calls(), 0);

        // At 15 s remaining (< 20 s threshold) the renewal runs.
        tokio::time::advance(Duration::from_secs(15)).await;
        renewer.tick().await;
        settle().await;
        assert_eq!(client.calls(), 1);
        assert_eq!(renewed.load(Ordering::SeqCst), 1);

        let info = renewer.status("l1").await.unwrap();
        assert_eq!(info.status, LeaseStatus::Active);
        assert_eq!(info.retry_count, 0);
        assert!(info.expires_in_secs > 50);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ticks_dispatch_at_most_one_renewal() {
        let client =
            Arc::new(ScriptedClient::new(vec![]).with_delay(Duration::from_secs(5)));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks::default(),
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("db.creds.app", 60)).await;
        tokio::time::advance(Duration::from_secs(45)).await;

        renewer.tick().await;
        renewer.tick().await;
        settle().await;
        // The in-flight renewal holds status `renewing`; the second tick
        // must not dispatch again.
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_fires_on_expired_and_disappears() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let expired = Arc::new(AtomicUsize::new(0));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks {
                on_expired: Some(counter_hook(&expired)),
                ..LeaseCallbacks::default()
            },
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("db.creds.app", 60)).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        renewer.tick().await;
        settle().await;

        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(renewer.list().await.is_empty());
        assert!(matches!(
            renewer.status("l1").await,
            Err(LeaseError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_soon_fires_once_per_status_interval() {
        let client =
            Arc::new(ScriptedClient::new(vec![Err(ConnectionError::Timeout)]));
        let warned = Arc::new(AtomicUsize::new(0));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks {
                on_expiring_soon: Some(counter_hook(&warned)),
                ..LeaseCallbacks::default()
            },
            LeaseRenewerOptions::default(),
        ));

        // 400 s lease: the 300 s warning window opens at t=100.
        renewer.track("l1", track_request("db.creds.app", 400)).await;
        tokio::time::advance(Duration::from_secs(120)).await;
        renewer.tick().await;
        settle().await;
        assert_eq!(warned.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        renewer.tick().await;
        settle().await;
        assert_eq!(warned.load(Ordering::SeqCst), 1, "warning must not repeat");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ConnectionError::Timeout),
            Ok(LeaseRenewal {
                lease_duration: 60,
                renewable: true,
            }),
        ]));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks::default(),
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("db.creds.app", 60)).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        renewer.tick().await;
        settle().await;

        let info = renewer.status("l1").await.unwrap();
        assert_eq!(info.status, LeaseStatus::Failed);
        assert_eq!(info.retry_count, 1);

        // First retry backoff is 1 s (+ jitter ≤ 250 ms).
        tokio::time::advance(Duration::from_secs(2)).await;
        renewer.tick().await;
        settle().await;

        let info = renewer.status("l1").await.unwrap();
        assert_eq!(info.status, LeaseStatus::Active);
        assert_eq!(info.retry_count, 0);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_fires_on_failed_and_removes() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ConnectionError::Timeout),
            Err(ConnectionError::Timeout),
            Err(ConnectionError::Timeout),
        ]));
        let failed = Arc::new(AtomicUsize::new(0));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks {
                on_failed: Some(counter_hook(&failed)),
                ..LeaseCallbacks::default()
            },
            LeaseRenewerOptions {
                max_retries: 3,
                ..LeaseRenewerOptions::default()
            },
        ));

        renewer.track("l1", track_request("db.creds.app", 600)).await;
        tokio::time::advance(Duration::from_secs(450)).await;

        // Drive through the retries: each backoff is at most 60 s + jitter.
        for _ in 0..5 {
            renewer.tick().await;
            settle().await;
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(renewer.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_server_error_abandons_immediately() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ConnectionError::Server {
            kind: "not_renewable".to_owned(),
            detail: "lease is one-shot".to_owned(),
        })]));
        let failed = Arc::new(AtomicUsize::new(0));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks {
                on_failed: Some(counter_hook(&failed)),
                ..LeaseCallbacks::default()
            },
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("db.creds.app", 60)).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        renewer.tick().await;
        settle().await;

        assert_eq!(client.calls(), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(renewer.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn untrack_is_silent() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let fired = Arc::new(AtomicUsize::new(0));
        let hook = counter_hook(&fired);
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks {
                on_renewed: Some(Arc::clone(&hook)),
                on_expired: Some(Arc::clone(&hook)),
                on_failed: Some(hook),
                ..LeaseCallbacks::default()
            },
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("db.creds.app", 60)).await;
        renewer.untrack("l1").await;
        tokio::time::advance(Duration::from_secs(120)).await;
        renewer.tick().await;
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(renewer.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_poison_state() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks {
                on_renewed: Some(Arc::new(|_event| panic!("callback bug"))),
                ..LeaseCallbacks::default()
            },
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("db.creds.app", 60)).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        renewer.tick().await;
        settle().await;

        // The renewal itself succeeded despite the panicking hook.
        let info = renewer.status("l1").await.unwrap();
        assert_eq!(info.status, LeaseStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_lifecycle_counters() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let renewer = Arc::new(LeaseRenewer::new(
            Arc::clone(&client) as Arc<dyn LeaseClient>,
            LeaseCallbacks::default(),
            LeaseRenewerOptions::default(),
        ));

        renewer.track("l1", track_request("a.b", 60)).await;
        renewer.track("l2", track_request("c.d", 600)).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        renewer.tick().await;
        settle().await;

        let stats = renewer.stats().await;
        assert_eq!(stats.tracked, 2);
        assert_eq!(stats.renewed_total, 1);
        assert_eq!(stats.active, 2);
    }
}
