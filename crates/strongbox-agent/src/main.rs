//! `Strongbox` agent entry point.
//!
//! Hardens the process, bootstraps a client certificate when needed, then
//! wires the core components together: endpoint manager, connection
//! supervisor, secret cache, lease renewer, and the UDS listener. All
//! long-lived components run as tasks cancelled through a shared shutdown
//! signal on SIGINT/SIGTERM.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use strongbox_core::bootstrap::{Bootstrapper, needs_bootstrap};
use strongbox_core::cache::SecretCache;
use strongbox_core::connection::ConnectionSupervisor;
use strongbox_core::endpoint::EndpointManager;
use strongbox_core::lease::{LeaseCallbacks, LeaseClient, LeaseRenewer};
use strongbox_core::notify::EventBus;
use strongbox_core::policy::PolicyStore;
use strongbox_core::tls;
use strongbox_core::transport::{CoreConnector, TlsConnector};

use strongbox_agent::audit::{AuditLog, FileAuditSink};
use strongbox_agent::config::AgentConfig;
use strongbox_agent::hardening;
use strongbox_agent::identity::IdentityVerifier;
use strongbox_agent::uds::{UdsServer, UdsServerOptions};

/// How long core connect attempts (TCP + TLS) may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long background tasks get to wind down after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env();

    // Hardening runs before logging exists; surface warnings on stderr.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(
        agent_id = %config.agent_id,
        endpoints = config.core_endpoints.len(),
        socket = %config.socket_path.display(),
        "strongbox agent starting"
    );

    prepare_cert_dir(&config.cert_dir)
        .with_context(|| format!("unusable cert dir '{}'", config.cert_dir.display()))?;

    let endpoints = Arc::new(EndpointManager::new(
        config.core_endpoints.clone(),
        config.endpoint_options(),
    ));

    if needs_bootstrap(&config.cert_dir) {
        bootstrap(&config, &endpoints)
            .await
            .context("bootstrap enrolment failed")?;
    }

    // Steady-state TLS uses the freshly installed (or pre-existing) client
    // certificate.
    let client_tls = tls::core_client_config(&config.cert_dir, true)
        .context("failed to build core client TLS config")?;
    let connector: Arc<dyn CoreConnector> =
        Arc::new(TlsConnector::new(client_tls, CONNECT_TIMEOUT));

    let cache = Arc::new(SecretCache::new(config.cache_options()));
    let policies = Arc::new(match &config.policy_file {
        Some(path) => PolicyStore::load_file(path).context("failed to load policy file")?,
        None => {
            warn!("no policy file configured; all application requests will be denied until core pushes policies");
            PolicyStore::new()
        }
    });

    let events = EventBus::default();
    let supervisor = Arc::new(ConnectionSupervisor::new(
        config.connection_options(),
        Arc::clone(&endpoints),
        connector,
        Arc::clone(&cache),
        Some(Arc::clone(&policies)),
        events.clone(),
    ));

    let renewer = Arc::new(LeaseRenewer::new(
        Arc::clone(&supervisor) as Arc<dyn LeaseClient>,
        lease_logging_callbacks(),
        config.lease_options(),
    ));

    let verifier = Arc::new(match &config.revocation_file {
        Some(path) => {
            IdentityVerifier::load_revocations(path).context("failed to load revocation list")?
        }
        None => IdentityVerifier::default(),
    });

    let audit = Arc::new(match &config.audit_file {
        Some(path) => {
            info!(path = %path.display(), "uds audit trail enabled");
            AuditLog::new().with_sink(Arc::new(FileAuditSink::new(path)))
        }
        None => AuditLog::new(),
    });

    let uds_tls =
        tls::uds_server_config(&config.cert_dir).context("failed to build uds TLS config")?;
    let uds = Arc::new(UdsServer::new(
        UdsServerOptions {
            socket_path: config.socket_path.clone(),
            max_connections: config.max_connections,
        },
        uds_tls,
        verifier,
        policies,
        Arc::clone(&cache),
        Arc::clone(&supervisor),
        Arc::clone(&renewer),
        audit,
    ));
    let listener = uds.bind().await.context("failed to bind uds listener")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        Arc::clone(&supervisor).run(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        Arc::clone(&endpoints).run_health_ticker(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(Arc::clone(&cache).run_cleanup(shutdown_rx.clone())));
    tasks.push(tokio::spawn(Arc::clone(&renewer).run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(uds.run(listener, shutdown_rx.clone())));
    tasks.push(tokio::spawn(status_reporter(
        Arc::clone(&cache),
        Arc::clone(&renewer),
        Arc::clone(&endpoints),
        shutdown_rx,
    )));

    // Block until the host asks us to stop, then broadcast the shutdown.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        tokio::select! {
            _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown requested"),
            _ = sigint.recv() => info!(signal = "SIGINT", "shutdown requested"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("shutdown requested");
    }
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("background task did not stop within the shutdown grace period");
        }
    }

    info!("strongbox agent stopped");
    Ok(())
}

/// Run bootstrap enrolment with one-time credentials from the environment.
async fn bootstrap(config: &AgentConfig, endpoints: &Arc<EndpointManager>) -> anyhow::Result<()> {
    let role_id = std::env::var("STRONGBOX_AGENT_ROLE_ID")
        .context("bootstrap required but STRONGBOX_AGENT_ROLE_ID is not set")?;
    let secret_id = Zeroizing::new(
        std::env::var("STRONGBOX_AGENT_SECRET_ID")
            .context("bootstrap required but STRONGBOX_AGENT_SECRET_ID is not set")?,
    );

    // Bootstrap trusts the pre-provisioned CA chain in the cert dir; the
    // session itself proves identity via the one-time credentials.
    let bootstrap_tls = tls::core_client_config(&config.cert_dir, false).context(
        "bootstrap needs a pre-provisioned ca-chain.pem in the cert dir to trust core",
    )?;
    let connector = TlsConnector::new(bootstrap_tls, CONNECT_TIMEOUT);

    let bootstrapper = Bootstrapper::new(config.bootstrap_options(), Arc::clone(endpoints));
    let artifact = bootstrapper
        .enrol(&connector, &role_id, &secret_id)
        .await?;
    info!(
        serial = %artifact.serial,
        not_after = %artifact.not_after,
        "bootstrap complete"
    );
    Ok(())
}

/// Ensure the certificate directory exists and is private to the agent.
fn prepare_cert_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Lease lifecycle visibility: the daemon only logs; applications learn of
/// changes by re-requesting.
fn lease_logging_callbacks() -> LeaseCallbacks {
    LeaseCallbacks {
        on_renewed: Some(Arc::new(|event| {
            debug!(lease_id = %event.lease_id, path = %event.secret_path, "lease renewed");
        })),
        on_expiring_soon: Some(Arc::new(|event| {
            warn!(lease_id = %event.lease_id, path = %event.secret_path, "lease expiring soon");
        })),
        on_expired: Some(Arc::new(|event| {
            warn!(lease_id = %event.lease_id, path = %event.secret_path, "lease expired");
        })),
        on_failed: Some(Arc::new(|event| {
            warn!(
                lease_id = %event.lease_id,
                path = %event.secret_path,
                detail = event.detail.as_deref().unwrap_or(""),
                "lease renewal abandoned"
            );
        })),
    }
}

/// Periodic one-line status summary.
async fn status_reporter(
    cache: Arc<SecretCache>,
    renewer: Arc<LeaseRenewer>,
    endpoints: Arc<EndpointManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let cache_stats = cache.stats().await;
                let lease_stats = renewer.stats().await;
                let healthy = endpoints
                    .health()
                    .await
                    .iter()
                    .filter(|e| e.backoff_remaining_secs.is_none())
                    .count();
                info!(
                    cache_size = cache_stats.size,
                    cache_hit_rate = cache_stats.hit_rate,
                    leases = lease_stats.tracked,
                    leases_renewing = lease_stats.renewing,
                    endpoints_available = healthy,
                    "agent status"
                );
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Apply process hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &AgentConfig) {
    for warning in hardening::apply(config.disable_mlock) {
        eprintln!("WARNING: {warning}");
    }
}
