//! Daemon configuration.
//!
//! Loaded from `STRONGBOX_AGENT_*` environment variables with sensible
//! defaults, then translated into the explicit option structs each
//! component is constructed from. No component reads the environment
//! itself.

use std::path::PathBuf;
use std::time::Duration;

use strongbox_core::bootstrap::BootstrapOptions;
use strongbox_core::cache::CacheOptions;
use strongbox_core::connection::ConnectionOptions;
use strongbox_core::endpoint::EndpointManagerOptions;
use strongbox_core::lease::LeaseRenewerOptions;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity used in the session handshake and the certificate subject.
    pub agent_id: String,
    /// Organization placed in the CSR subject.
    pub organization: String,
    /// Core endpoints, tried round-robin with health filtering.
    pub core_endpoints: Vec<String>,
    /// Directory holding the key, certificate, and CA chain.
    pub cert_dir: PathBuf,
    /// UDS endpoint served to local applications.
    pub socket_path: PathBuf,
    /// Concurrent UDS connection limit.
    pub max_connections: usize,
    /// Endpoint backoff-clearing tick cadence.
    pub endpoint_health_check_interval: Duration,
    /// Consecutive failures before endpoint failover.
    pub endpoint_failover_threshold: u32,
    /// Default cache TTL.
    pub cache_ttl: Duration,
    /// Cache entry bound.
    pub cache_max_size: usize,
    /// Whether expired entries may be served during outages.
    pub cache_fallback_enabled: bool,
    /// How long past expiry an entry stays eligible for fallback.
    pub cache_fallback_window: Duration,
    /// Lease scheduler tick cadence.
    pub lease_check_interval: Duration,
    /// Renewal attempts before a lease is abandoned.
    pub lease_max_retries: u32,
    /// Per-request reply deadline on the core session.
    pub request_timeout: Duration,
    /// Optional JSON file of per-application policies.
    pub policy_file: Option<PathBuf>,
    /// Optional file of revoked client certificate serials.
    pub revocation_file: Option<PathBuf>,
    /// Optional JSON-lines audit trail of UDS decisions.
    pub audit_file: Option<PathBuf>,
    /// Log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Skip `mlockall` (development without `CAP_IPC_LOCK`).
    pub disable_mlock: bool,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STRONGBOX_AGENT_ID` — agent identity (default: `agent-<uuid>`)
    /// - `STRONGBOX_AGENT_ORG` — CSR organization (default: `strongbox`)
    /// - `STRONGBOX_AGENT_CORE_ENDPOINTS` — comma-separated `host:port`
    ///   list (default: `127.0.0.1:8700`)
    /// - `STRONGBOX_AGENT_CERT_DIR` — certificate directory (default:
    ///   `/var/lib/strongbox/certs`)
    /// - `STRONGBOX_AGENT_SOCKET_PATH` — UDS path (default:
    ///   `/var/run/strongbox/agent.sock`)
    /// - `STRONGBOX_AGENT_MAX_CONNECTIONS` — UDS connection cap (default: `100`)
    /// - `STRONGBOX_AGENT_ENDPOINT_HEALTH_INTERVAL` — seconds (default: `30`)
    /// - `STRONGBOX_AGENT_ENDPOINT_FAILOVER_THRESHOLD` — failures (default: `3`)
    /// - `STRONGBOX_AGENT_CACHE_TTL` — seconds (default: `300`)
    /// - `STRONGBOX_AGENT_CACHE_MAX_SIZE` — entries (default: `1000`)
    /// - `STRONGBOX_AGENT_CACHE_FALLBACK` — serve stale during outages
    ///   (default: `true`)
    /// - `STRONGBOX_AGENT_CACHE_FALLBACK_WINDOW` — seconds (default: `3600`)
    /// - `STRONGBOX_AGENT_LEASE_CHECK_INTERVAL` — seconds (default: `10`)
    /// - `STRONGBOX_AGENT_LEASE_MAX_RETRIES` — attempts (default: `5`)
    /// - `STRONGBOX_AGENT_REQUEST_TIMEOUT` — seconds (default: `5`)
    /// - `STRONGBOX_AGENT_POLICY_FILE` — policy JSON path (optional)
    /// - `STRONGBOX_AGENT_REVOCATION_FILE` — revoked serials path (optional)
    /// - `STRONGBOX_AGENT_AUDIT_FILE` — audit trail path (optional)
    /// - `STRONGBOX_AGENT_LOG_LEVEL` — log filter (default: `info`)
    /// - `STRONGBOX_AGENT_DISABLE_MLOCK` — skip memory locking (default:
    ///   `false`)
    #[must_use]
    pub fn from_env() -> Self {
        let agent_id = std::env::var("STRONGBOX_AGENT_ID")
            .unwrap_or_else(|_| format!("agent-{}", uuid::Uuid::new_v4()));

        let organization =
            std::env::var("STRONGBOX_AGENT_ORG").unwrap_or_else(|_| "strongbox".to_owned());

        let core_endpoints: Vec<String> = std::env::var("STRONGBOX_AGENT_CORE_ENDPOINTS")
            .unwrap_or_else(|_| "127.0.0.1:8700".to_owned())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let cert_dir = PathBuf::from(
            std::env::var("STRONGBOX_AGENT_CERT_DIR")
                .unwrap_or_else(|_| "/var/lib/strongbox/certs".to_owned()),
        );

        let socket_path = PathBuf::from(
            std::env::var("STRONGBOX_AGENT_SOCKET_PATH")
                .unwrap_or_else(|_| "/var/run/strongbox/agent.sock".to_owned()),
        );

        Self {
            agent_id,
            organization,
            core_endpoints,
            cert_dir,
            socket_path,
            max_connections: env_parse("STRONGBOX_AGENT_MAX_CONNECTIONS", 100),
            endpoint_health_check_interval: Duration::from_secs(env_parse(
                "STRONGBOX_AGENT_ENDPOINT_HEALTH_INTERVAL",
                30,
            )),
            endpoint_failover_threshold: env_parse(
                "STRONGBOX_AGENT_ENDPOINT_FAILOVER_THRESHOLD",
                3,
            ),
            cache_ttl: Duration::from_secs(env_parse("STRONGBOX_AGENT_CACHE_TTL", 300)),
            cache_max_size: env_parse("STRONGBOX_AGENT_CACHE_MAX_SIZE", 1000),
            cache_fallback_enabled: env_flag("STRONGBOX_AGENT_CACHE_FALLBACK", true),
            cache_fallback_window: Duration::from_secs(env_parse(
                "STRONGBOX_AGENT_CACHE_FALLBACK_WINDOW",
                3600,
            )),
            lease_check_interval: Duration::from_secs(env_parse(
                "STRONGBOX_AGENT_LEASE_CHECK_INTERVAL",
                10,
            )),
            lease_max_retries: env_parse("STRONGBOX_AGENT_LEASE_MAX_RETRIES", 5),
            request_timeout: Duration::from_secs(env_parse(
                "STRONGBOX_AGENT_REQUEST_TIMEOUT",
                5,
            )),
            policy_file: std::env::var("STRONGBOX_AGENT_POLICY_FILE")
                .ok()
                .map(PathBuf::from),
            revocation_file: std::env::var("STRONGBOX_AGENT_REVOCATION_FILE")
                .ok()
                .map(PathBuf::from),
            audit_file: std::env::var("STRONGBOX_AGENT_AUDIT_FILE")
                .ok()
                .map(PathBuf::from),
            log_level: std::env::var("STRONGBOX_AGENT_LOG_LEVEL")
                .unwrap_or_else(|_| "info".to_owned()),
            disable_mlock: env_flag("STRONGBOX_AGENT_DISABLE_MLOCK", false),
        }
    }

    /// Options for the endpoint manager.
    #[must_use]
    pub fn endpoint_options(&self) -> EndpointManagerOptions {
        EndpointManagerOptions {
            failover_threshold: self.endpoint_failover_threshold,
            health_check_interval: self.endpoint_health_check_interval,
            ..EndpointManagerOptions::default()
        }
    }

    /// Options for the connection supervisor.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            agent_id: self.agent_id.clone(),
            request_timeout: self.request_timeout,
            ..ConnectionOptions::default()
        }
    }

    /// Options for the secret cache.
    #[must_use]
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            default_ttl: self.cache_ttl,
            max_entries: self.cache_max_size,
            fallback_enabled: self.cache_fallback_enabled,
            fallback_window: self.cache_fallback_window,
            ..CacheOptions::default()
        }
    }

    /// Options for the lease renewer.
    #[must_use]
    pub fn lease_options(&self) -> LeaseRenewerOptions {
        LeaseRenewerOptions {
            check_interval: self.lease_check_interval,
            max_retries: self.lease_max_retries,
            ..LeaseRenewerOptions::default()
        }
    }

    /// Options for bootstrap enrolment and renewal.
    #[must_use]
    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions::new(
            self.agent_id.clone(),
            self.organization.clone(),
            self.cert_dir.clone(),
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}
