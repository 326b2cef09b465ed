//! The connection supervisor: one authenticated duplex session to core.
//!
//! The supervisor owns the session lifecycle (connect, handshake, serve,
//! reconnect with jittered exponential backoff) and multiplexes concurrent
//! request/reply exchanges over the single transport via correlation IDs.
//! Server-initiated pushes are dispatched to the secret cache, the policy
//! store, and the notification bus.
//!
//! Requests suspend the caller until a reply, the per-call deadline, or a
//! session state change resolves them. On transport drop every pending
//! waiter is failed with `ConnectionLost` before the transport is closed;
//! on shutdown the session drains — new requests are rejected while pending
//! ones are given until the drain deadline to resolve.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{RwLock, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::cache::SecretCache;
use crate::endpoint::EndpointManager;
use crate::error::{ConnectionError, TransportError};
use crate::lease::LeaseClient;
use crate::notify::{AgentEvent, EventBus};
use crate::policy::PolicyStore;
use crate::proto::{
    DynamicSecret, ErrorDetail, Frame, LeaseRenewal, ReplyEnvelope, ReplyStatus, RotationNotice,
    SecretValue, event,
};
use crate::transport::{CoreConnector, Transport};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session; a reconnect is pending or the agent is stopped.
    Disconnected,
    /// A connect attempt (transport open + session join) is in progress.
    Connecting,
    /// The session is established and serving requests.
    Connected,
    /// Shutdown requested; pending requests are draining.
    Draining,
}

/// Tuning knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Identity sent in the session join handshake.
    pub agent_id: String,
    /// Per-request reply deadline.
    pub request_timeout: Duration,
    /// Heartbeat send cadence.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the session is declared dead.
    pub idle_timeout: Duration,
    /// Deadline for the session join reply.
    pub handshake_timeout: Duration,
    /// Upper bound on waiting for pending requests during shutdown.
    pub drain_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

struct PendingRequest {
    waiter: oneshot::Sender<Result<serde_json::Value, ConnectionError>>,
    kind: &'static str,
}

enum SessionEnd {
    /// Transport dropped or heartbeats went silent.
    Dropped,
    /// Shutdown was requested and the drain completed (or timed out).
    Shutdown,
}

/// Supervises the single session between this agent and core.
pub struct ConnectionSupervisor {
    opts: ConnectionOptions,
    endpoints: Arc<EndpointManager>,
    connector: Arc<dyn CoreConnector>,
    cache: Arc<SecretCache>,
    policies: Option<Arc<PolicyStore>>,
    events: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    current: RwLock<Option<Arc<dyn Transport>>>,
    pending: StdMutex<HashMap<u64, PendingRequest>>,
    next_ref: AtomicU64,
    last_rx: StdMutex<Instant>,
}

impl ConnectionSupervisor {
    /// Create a supervisor. It does nothing until [`run`](Self::run) is
    /// spawned.
    #[must_use]
    pub fn new(
        opts: ConnectionOptions,
        endpoints: Arc<EndpointManager>,
        connector: Arc<dyn CoreConnector>,
        cache: Arc<SecretCache>,
        policies: Option<Arc<PolicyStore>>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            opts,
            endpoints,
            connector,
            cache,
            policies,
            events,
            state_tx,
            current: RwLock::new(None),
            pending: StdMutex::new(HashMap::new()),
            next_ref: AtomicU64::new(0),
            last_rx: StdMutex::new(Instant::now()),
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch session state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Fetch a static secret by path.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotConnected`], [`ConnectionError::Timeout`],
    /// [`ConnectionError::Server`], or [`ConnectionError::ConnectionLost`].
    pub async fn get_static(&self, path: &str) -> Result<SecretValue, ConnectionError> {
        let response = self
            .request(event::GET_STATIC, json!({ "path": path }), "get_static")
            .await?;
        serde_json::from_value(response).map_err(|e| ConnectionError::Protocol {
            reason: format!("bad get_static reply: {e}"),
        })
    }

    /// Mint dynamic credentials for a role.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`get_static`](Self::get_static).
    pub async fn get_dynamic(
        &self,
        role: &str,
        ttl_secs: u64,
    ) -> Result<DynamicSecret, ConnectionError> {
        let response = self
            .request(
                event::GET_DYNAMIC,
                json!({ "role": role, "ttl": ttl_secs }),
                "get_dynamic",
            )
            .await?;
        serde_json::from_value(response).map_err(|e| ConnectionError::Protocol {
            reason: format!("bad get_dynamic reply: {e}"),
        })
    }

    /// Renew a lease.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`get_static`](Self::get_static).
    pub async fn renew(
        &self,
        lease_id: &str,
        increment_secs: u64,
    ) -> Result<LeaseRenewal, ConnectionError> {
        let response = self
            .request(
                event::LEASE_RENEW,
                json!({ "lease_id": lease_id, "increment": increment_secs }),
                "renew_lease",
            )
            .await?;
        serde_json::from_value(response).map_err(|e| ConnectionError::Protocol {
            reason: format!("bad lease renewal reply: {e}"),
        })
    }

    /// Issue one correlated request and suspend until its outcome.
    async fn request(
        &self,
        event_name: &str,
        payload: serde_json::Value,
        kind: &'static str,
    ) -> Result<serde_json::Value, ConnectionError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Draining => return Err(ConnectionError::Shutdown),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(ConnectionError::NotConnected);
            }
        }
        let transport = {
            let guard = self.current.read().await;
            guard.clone().ok_or(ConnectionError::NotConnected)?
        };

        let id = self.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock_pending()
            .insert(id, PendingRequest { waiter: tx, kind });

        let frame = Frame::request(event_name, payload, id);
        if let Err(e) = transport.send(&frame).await {
            self.take_pending(id);
            debug!(kind, error = %e, "request send failed");
            return Err(ConnectionError::ConnectionLost);
        }

        match tokio::time::timeout(self.opts.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without a verdict: session teardown races.
            Ok(Err(_)) => Err(ConnectionError::ConnectionLost),
            Err(_) => {
                self.take_pending(id);
                Err(ConnectionError::Timeout)
            }
        }
    }

    /// Supervision loop: connect, serve, reconnect. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let endpoint = match self.endpoints.next().await {
                Ok(url) => url,
                Err(e) => {
                    attempts = attempts.saturating_add(1);
                    let delay = backoff::with_jitter(backoff::reconnect_delay(attempts));
                    warn!(error = %e, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "no endpoint to connect to");
                    self.set_state(ConnectionState::Disconnected);
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.open_session(&endpoint).await {
                Ok(transport) => {
                    self.endpoints.report_success(&endpoint).await;
                    attempts = 0;
                    *self.current.write().await = Some(Arc::clone(&transport));
                    self.note_rx();
                    self.set_state(ConnectionState::Connected);
                    info!(endpoint = %endpoint, "core session established");

                    let end = self.serve_session(&transport, &mut shutdown).await;

                    *self.current.write().await = None;
                    self.fail_pending();
                    transport.close().await;
                    self.set_state(ConnectionState::Disconnected);

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped => {
                            // The next endpoint may be healthy; restart the
                            // backoff ladder.
                            attempts = 0;
                            info!(endpoint = %endpoint, "core session lost, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    self.endpoints.report_failure(&endpoint).await;
                    self.set_state(ConnectionState::Disconnected);
                    attempts = attempts.saturating_add(1);
                    let delay = backoff::with_jitter(backoff::reconnect_delay(attempts));
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "connect attempt failed"
                    );
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("connection supervisor stopped");
    }

    /// Open a transport and perform the session join handshake.
    async fn open_session(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = self.connector.connect(endpoint).await?;

        let id = self.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        let join = Frame::request(
            event::SESSION_JOIN,
            json!({ "agent_id": self.opts.agent_id }),
            id,
        );
        transport.send(&join).await?;

        let reply = tokio::time::timeout(self.opts.handshake_timeout, transport.recv())
            .await
            .map_err(|_| TransportError::Handshake {
                reason: "no session join acknowledgement".to_owned(),
            })??;

        if reply.correlation != Some(id) {
            return Err(TransportError::Handshake {
                reason: format!("unexpected frame '{}' during join", reply.event),
            });
        }
        let envelope: ReplyEnvelope =
            serde_json::from_value(reply.payload).map_err(|e| TransportError::Handshake {
                reason: format!("bad join reply: {e}"),
            })?;
        if envelope.status != ReplyStatus::Ok {
            let detail: ErrorDetail = serde_json::from_value(envelope.response).unwrap_or(
                ErrorDetail {
                    kind: "unknown".to_owned(),
                    detail: String::new(),
                },
            );
            return Err(TransportError::Handshake {
                reason: format!("join rejected ({}): {}", detail.kind, detail.detail),
            });
        }
        Ok(transport)
    }

    /// Serve one established session until it drops, goes silent, or the
    /// agent drains out.
    async fn serve_session(
        &self,
        transport: &Arc<dyn Transport>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.opts.heartbeat_interval,
            self.opts.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut draining = false;
        let mut drain_deadline = Instant::now();

        loop {
            tokio::select! {
                received = transport.recv() => match received {
                    Ok(frame) => {
                        self.note_rx();
                        self.dispatch(frame).await;
                        if draining && self.pending_is_empty() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "transport read ended");
                        return if draining { SessionEnd::Shutdown } else { SessionEnd::Dropped };
                    }
                },
                _ = heartbeat.tick() => {
                    if self.idle_for() >= self.opts.idle_timeout {
                        warn!("no traffic from core within the idle window, dropping session");
                        return if draining { SessionEnd::Shutdown } else { SessionEnd::Dropped };
                    }
                    let frame = Frame::push(event::HEARTBEAT, serde_json::Value::Null);
                    if let Err(e) = transport.send(&frame).await {
                        debug!(error = %e, "heartbeat send failed");
                        return if draining { SessionEnd::Shutdown } else { SessionEnd::Dropped };
                    }
                },
                changed = shutdown.changed(), if !draining => {
                    let _ = changed;
                    draining = true;
                    drain_deadline = Instant::now() + self.opts.drain_timeout;
                    self.set_state(ConnectionState::Draining);
                    if self.pending_is_empty() {
                        return SessionEnd::Shutdown;
                    }
                    info!("draining pending core requests before shutdown");
                },
                () = tokio::time::sleep(Duration::from_millis(50)), if draining => {
                    if self.pending_is_empty() || Instant::now() >= drain_deadline {
                        return SessionEnd::Shutdown;
                    }
                },
            }
        }
    }

    /// Route one incoming frame: replies pop their pending waiter, pushes
    /// go to their consumers.
    async fn dispatch(&self, frame: Frame) {
        let Some(id) = frame.correlation else {
            self.handle_push(frame).await;
            return;
        };
        let Some(pending) = self.take_pending(id) else {
            warn!(correlation = id, event = %frame.event, "reply for unknown correlation id dropped");
            return;
        };
        let outcome = parse_reply(frame.payload);
        if let Err(ref e) = outcome {
            debug!(kind = pending.kind, error = %e, "request completed with error");
        }
        let _ = pending.waiter.send(outcome);
    }

    /// Apply a server-initiated push.
    async fn handle_push(&self, frame: Frame) {
        match frame.event.as_str() {
            event::SECRET_ROTATED => match serde_json::from_value::<RotationNotice>(frame.payload)
            {
                Ok(notice) => {
                    self.cache.invalidate(&notice.path).await;
                    info!(path = %notice.path, new_version = notice.new_version, "secret rotated upstream, cache entry invalidated");
                    self.events.emit(AgentEvent::SecretRotated {
                        path: notice.path,
                        new_version: notice.new_version,
                    });
                }
                Err(e) => warn!(error = %e, "malformed rotation push dropped"),
            },
            event::POLICY_UPDATED => {
                if let Some(policies) = &self.policies {
                    match policies.apply_update(&frame.payload).await {
                        Ok(count) => info!(policies = count, "policy update applied"),
                        Err(e) => warn!(error = %e, "policy update rejected"),
                    }
                }
                self.events.emit(AgentEvent::PolicyUpdated);
            }
            event::HEARTBEAT => {}
            other => debug!(event = %other, "unhandled push event ignored"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.events.emit(AgentEvent::ConnectionStateChanged { state });
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self, id: u64) -> Option<PendingRequest> {
        self.lock_pending().remove(&id)
    }

    fn pending_is_empty(&self) -> bool {
        self.lock_pending().is_empty()
    }

    /// Fail every pending waiter with `ConnectionLost`.
    fn fail_pending(&self) {
        let drained: Vec<(u64, PendingRequest)> = self.lock_pending().drain().collect();
        for (id, pending) in drained {
            debug!(correlation = id, kind = pending.kind, "failing pending request on session teardown");
            let _ = pending.waiter.send(Err(ConnectionError::ConnectionLost));
        }
    }

    fn note_rx(&self) {
        *self.last_rx.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

#[async_trait]
impl LeaseClient for ConnectionSupervisor {
    async fn renew_lease(
        &self,
        lease_id: &str,
        increment_secs: u64,
    ) -> Result<LeaseRenewal, ConnectionError> {
        self.renew(lease_id, increment_secs).await
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Interpret a reply payload as an envelope and unwrap it.
fn parse_reply(payload: serde_json::Value) -> Result<serde_json::Value, ConnectionError> {
    let envelope: ReplyEnvelope =
        serde_json::from_value(payload).map_err(|e| ConnectionError::Protocol {
            reason: format!("bad reply envelope: {e}"),
        })?;
    match envelope.status {
        ReplyStatus::Ok => Ok(envelope.response),
        ReplyStatus::Error => {
            let detail: ErrorDetail =
                serde_json::from_value(envelope.response).unwrap_or(ErrorDetail {
                    kind: "unknown".to_owned(),
                    detail: String::new(),
                });
            Err(ConnectionError::Server {
                kind: detail.kind,
                detail: detail.detail,
            })
        }
    }
}

/// Sleep for `delay` unless shutdown flips first. Returns `true` when
/// shutdown was requested.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
