//! The UDS listener: framed secret requests from local applications over
//! mutually-authenticated TLS on a Unix socket.
//!
//! At bind time the parent directory is created with mode 0755, a
//! pre-existing socket is probed with a connect before being treated as
//! stale, and the bound socket gets mode 0660. Group ownership is left to
//! the service manager; the agent does not hold chown privileges.
//!
//! Each accepted connection is verified (chain by rustls, agent rules by
//! [`IdentityVerifier`]) and served on its own task. Policy is evaluated
//! before every request. Applications only ever see the stable reason set
//! — core-internal detail stays in the process log.

use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use strongbox_core::cache::SecretCache;
use strongbox_core::connection::ConnectionSupervisor;
use strongbox_core::error::{CacheError, ConnectionError, TransportError};
use strongbox_core::lease::{LeaseRenewer, TrackRequest};
use strongbox_core::policy::PolicyStore;
use strongbox_core::proto::{self, AppOp, AppReply, AppRequest};

use crate::audit::{AuditLog, AuditOutcome, AuditRecord};
use crate::error::ServeError;
use crate::identity::{ClientIdentity, IdentityVerifier};

/// Tuning knobs for the UDS listener.
#[derive(Debug, Clone)]
pub struct UdsServerOptions {
    pub socket_path: std::path::PathBuf,
    pub max_connections: usize,
}

/// Serves local applications over the Unix socket.
pub struct UdsServer {
    opts: UdsServerOptions,
    tls: TlsAcceptor,
    verifier: Arc<IdentityVerifier>,
    policies: Arc<PolicyStore>,
    cache: Arc<SecretCache>,
    supervisor: Arc<ConnectionSupervisor>,
    renewer: Arc<LeaseRenewer>,
    audit: Arc<AuditLog>,
    permits: Arc<Semaphore>,
}

impl UdsServer {
    /// Assemble a server from its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opts: UdsServerOptions,
        tls_config: Arc<rustls::ServerConfig>,
        verifier: Arc<IdentityVerifier>,
        policies: Arc<PolicyStore>,
        cache: Arc<SecretCache>,
        supervisor: Arc<ConnectionSupervisor>,
        renewer: Arc<LeaseRenewer>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(opts.max_connections));
        Self {
            opts,
            tls: TlsAcceptor::from(tls_config),
            verifier,
            policies,
            cache,
            supervisor,
            renewer,
            audit,
            permits,
        }
    }

    /// Prepare the socket path and bind the listener.
    ///
    /// # Errors
    ///
    /// - [`ServeError::AlreadyInUse`] when a live listener answers a probe
    ///   on the existing socket.
    /// - [`ServeError::Bind`] on directory or bind failures.
    pub async fn bind(&self) -> Result<UnixListener, ServeError> {
        let path = &self.opts.socket_path;
        let bind_err = |reason: String| ServeError::Bind {
            path: path.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| bind_err(e.to_string()))?;
            set_mode(parent, 0o755).map_err(|e| bind_err(e.to_string()))?;
        }

        if path.exists() {
            let probe = tokio::time::timeout(
                std::time::Duration::from_millis(500),
                UnixStream::connect(path),
            )
            .await;
            if matches!(probe, Ok(Ok(_))) {
                return Err(ServeError::AlreadyInUse { path: path.clone() });
            }
            info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(|e| bind_err(e.to_string()))?;
        }

        let listener = UnixListener::bind(path).map_err(|e| bind_err(e.to_string()))?;
        set_mode(path, 0o660).map_err(|e| bind_err(e.to_string()))?;
        info!(path = %path.display(), max_connections = self.opts.max_connections, "uds listener bound");
        Ok(listener)
    }

    /// Accept loop. Runs until the shutdown signal flips, then removes the
    /// socket.
    pub async fn run(self: Arc<Self>, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let permit = Arc::clone(&self.permits).try_acquire_owned().ok();
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, permit).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "uds accept failed");
                    }
                },
                _ = shutdown.changed() => {
                    info!("uds listener stopping");
                    break;
                }
            }
        }
        drop(listener);
        let _ = std::fs::remove_file(&self.opts.socket_path);
    }

    /// One connection: handshake, verify, then serve framed requests until
    /// the client goes away.
    async fn handle_connection(
        self: Arc<Self>,
        stream: UnixStream,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let mut stream = match self.tls.accept(stream).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "uds tls handshake failed");
                return;
            }
        };

        let Some(_permit) = permit else {
            debug!("uds connection limit reached, refusing connection");
            let _ = proto::write_frame(&mut stream, &AppReply::error("too_many_connections")).await;
            return;
        };

        let identity = {
            let leaf = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec());
            match leaf {
                Some(der) => self.verifier.verify(&der),
                None => {
                    // The verifier config requires a client cert during the
                    // handshake; a missing one here still closes the
                    // connection.
                    debug!("uds connection presented no client certificate");
                    return;
                }
            }
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "uds client rejected");
                self.audit
                    .record(AuditRecord::now(
                        None,
                        None,
                        None,
                        AuditOutcome::AuthFailed,
                        Some(e.to_string()),
                    ))
                    .await;
                let _ = proto::write_frame(
                    &mut stream,
                    &AppReply::error(&format!("authentication failed: {e}")),
                )
                .await;
                return;
            }
        };

        info!(app_id = %identity.app_id, "application connected");

        loop {
            let request: AppRequest = match proto::read_frame(&mut stream).await {
                Ok(request) => request,
                Err(TransportError::Malformed { reason }) => {
                    debug!(app_id = %identity.app_id, reason, "malformed uds request");
                    if proto::write_frame(&mut stream, &AppReply::error("bad_request"))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    debug!(app_id = %identity.app_id, error = %e, "uds read failed");
                    break;
                }
            };

            let reply = self.dispatch(&identity, request).await;
            if proto::write_frame(&mut stream, &reply).await.is_err() {
                break;
            }
        }

        debug!(app_id = %identity.app_id, "application disconnected");
    }

    /// Enforce policy and execute one request.
    async fn dispatch(&self, identity: &ClientIdentity, request: AppRequest) -> AppReply {
        match request.op {
            AppOp::GetSecret => {
                let Some(path) = request.path else {
                    return AppReply::error("bad_request");
                };
                if let Some(reply) = self
                    .enforce(identity, AppOp::GetSecret, Some(&path), None)
                    .await
                {
                    return reply;
                }
                self.get_secret(&path).await
            }
            AppOp::GetDynamic => {
                let Some(role) = request.role else {
                    return AppReply::error("bad_request");
                };
                if let Some(reply) = self
                    .enforce(identity, AppOp::GetDynamic, Some(&role), request.ttl)
                    .await
                {
                    return reply;
                }
                self.get_dynamic(identity, &role, request.ttl.unwrap_or(0))
                    .await
            }
            AppOp::Renew => {
                let Some(lease_id) = request.lease_id else {
                    return AppReply::error("bad_request");
                };
                let lease_path = self
                    .renewer
                    .status(&lease_id)
                    .await
                    .map(|info| info.secret_path)
                    .ok();
                if let Some(reply) = self
                    .enforce(identity, AppOp::Renew, lease_path.as_deref(), None)
                    .await
                {
                    return reply;
                }
                self.renew(&lease_id, request.ttl.unwrap_or(0)).await
            }
        }
    }

    /// Policy gate. Returns the denial reply when the request is refused;
    /// audits either way.
    async fn enforce(
        &self,
        identity: &ClientIdentity,
        op: AppOp,
        path: Option<&str>,
        ttl: Option<u64>,
    ) -> Option<AppReply> {
        match self.policies.check(&identity.app_id, op, path, ttl).await {
            Ok(()) => {
                self.audit
                    .record(AuditRecord::now(
                        Some(identity.app_id.to_string()),
                        Some(op.as_str().to_owned()),
                        path.map(str::to_owned),
                        AuditOutcome::Granted,
                        None,
                    ))
                    .await;
                None
            }
            Err(e) => {
                info!(app_id = %identity.app_id, op = op.as_str(), error = %e, "request denied by policy");
                self.audit
                    .record(AuditRecord::now(
                        Some(identity.app_id.to_string()),
                        Some(op.as_str().to_owned()),
                        path.map(str::to_owned),
                        AuditOutcome::Denied,
                        Some(e.to_string()),
                    ))
                    .await;
                Some(AppReply::error("denied"))
            }
        }
    }

    async fn get_secret(&self, path: &str) -> AppReply {
        let supervisor = Arc::clone(&self.supervisor);
        let fetch_path = path.to_owned();
        let result = self
            .cache
            .get_or_fetch(path, || async move {
                supervisor.get_static(&fetch_path).await
            })
            .await;

        match result {
            Ok(cached) => {
                let mut data = serde_json::json!({
                    "value": cached.secret.value,
                    "version": cached.secret.version,
                    "metadata": cached.secret.metadata,
                });
                if !cached.fresh {
                    data["stale"] = serde_json::Value::Bool(true);
                }
                AppReply::ok(data)
            }
            Err(e) => {
                debug!(path, error = %e, "get_secret failed");
                AppReply::error(cache_reason(&e))
            }
        }
    }

    async fn get_dynamic(&self, identity: &ClientIdentity, role: &str, ttl: u64) -> AppReply {
        match self.supervisor.get_dynamic(role, ttl).await {
            Ok(minted) => {
                self.renewer
                    .track(
                        &minted.lease_id,
                        TrackRequest {
                            secret_path: role.to_owned(),
                            credentials: minted.credentials.clone(),
                            duration_secs: minted.lease_duration,
                            metadata: std::collections::HashMap::from([(
                                "app_id".to_owned(),
                                identity.app_id.to_string(),
                            )]),
                        },
                    )
                    .await;
                AppReply::ok(serde_json::json!({
                    "credentials": minted.credentials,
                    "lease_id": minted.lease_id,
                    "lease_duration": minted.lease_duration,
                    "renewable": minted.renewable,
                }))
            }
            Err(e) => {
                debug!(role, error = %e, "get_dynamic failed");
                AppReply::error(connection_reason(&e))
            }
        }
    }

    async fn renew(&self, lease_id: &str, increment: u64) -> AppReply {
        match self.supervisor.renew(lease_id, increment).await {
            Ok(renewal) => AppReply::ok(serde_json::json!({
                "lease_duration": renewal.lease_duration,
                "renewable": renewal.renewable,
            })),
            Err(e) => {
                debug!(lease_id, error = %e, "renew failed");
                AppReply::error(connection_reason(&e))
            }
        }
    }
}

impl std::fmt::Debug for UdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsServer")
            .field("socket_path", &self.opts.socket_path)
            .finish_non_exhaustive()
    }
}

/// Map a connection error to the stable reason set shown to applications.
fn connection_reason(err: &ConnectionError) -> &'static str {
    match err {
        ConnectionError::NotConnected
        | ConnectionError::ConnectionLost
        | ConnectionError::Shutdown => "unavailable",
        ConnectionError::Timeout => "timeout",
        ConnectionError::Server { kind, .. } => match kind.as_str() {
            "not_found" => "not_found",
            "denied" | "permission_denied" => "denied",
            _ => "internal",
        },
        ConnectionError::Protocol { .. } => "internal",
    }
}

/// Map a cache error to the stable reason set shown to applications.
fn cache_reason(err: &CacheError) -> &'static str {
    match err {
        CacheError::NotFound { .. } => "not_found",
        CacheError::Expired { .. } => "expired",
        CacheError::Upstream { source } => connection_reason(source),
        CacheError::Canceled => "internal",
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
