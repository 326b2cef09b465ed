//! Error types for `strongbox-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. No variant ever includes secret bytes, private key material,
//! or AppRole secret IDs — only paths, identifiers, and operation
//! descriptions.

use std::sync::Arc;

/// Errors from TLS configuration and PEM loading.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A PEM file could not be read or contained no usable entries.
    #[error("failed to load PEM from '{path}': {reason}")]
    Pem { path: String, reason: String },

    /// The key file contained no private key.
    #[error("no private key found in '{path}'")]
    NoPrivateKey { path: String },

    /// Building the rustls client/server config failed.
    #[error("tls config error: {reason}")]
    Config { reason: String },
}

/// Errors from the duplex transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Establishing the underlying connection failed.
    #[error("failed to connect to '{endpoint}': {reason}")]
    Connect { endpoint: String, reason: String },

    /// The endpoint string could not be interpreted.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// TLS setup failed.
    #[error("transport tls error: {0}")]
    Tls(#[from] TlsError),

    /// The session-join or authenticate handshake was rejected.
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    /// An I/O error on the established transport.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An incoming frame announced a length beyond the protocol limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// A frame failed to parse as the expected JSON document.
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    /// The peer closed the transport.
    #[error("transport closed by peer")]
    Closed,
}

/// Errors from the endpoint manager.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Every configured endpoint is sitting out a backoff period.
    #[error("no healthy core endpoint available")]
    NoHealthy,

    /// A status report referenced an endpoint that was never configured.
    #[error("unknown endpoint: {url}")]
    Unknown { url: String },
}

/// Errors surfaced by the connection supervisor's request API.
///
/// Transport-level failures are converted into these categorical kinds at
/// the supervisor boundary; raw transport errors never escape it.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// No session to core is currently established.
    #[error("not connected to core")]
    NotConnected,

    /// No reply arrived within the per-call deadline.
    #[error("request timed out")]
    Timeout,

    /// The session dropped while the request was pending.
    #[error("connection to core lost")]
    ConnectionLost,

    /// The agent is draining; no new requests are accepted.
    #[error("agent is shutting down")]
    Shutdown,

    /// Core replied with an error status.
    #[error("core returned error '{kind}': {detail}")]
    Server { kind: String, detail: String },

    /// The reply could not be interpreted.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

/// Errors from the secret cache.
///
/// `Clone` so a single fetch outcome can be delivered to every caller
/// coalesced into one single-flight fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// No entry exists for the path.
    #[error("secret not cached: {path}")]
    NotFound { path: String },

    /// An entry exists but its TTL has elapsed and stale fallback did not
    /// apply.
    #[error("cached secret expired: {path}")]
    Expired { path: String },

    /// The upstream fetch failed and no stale entry was available.
    #[error("upstream fetch failed: {source}")]
    Upstream {
        #[source]
        source: Arc<ConnectionError>,
    },

    /// The in-flight fetch was abandoned before producing a result.
    #[error("fetch canceled")]
    Canceled,
}

/// Errors from the lease renewer's public API.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease is not tracked.
    #[error("lease not tracked: {lease_id}")]
    NotFound { lease_id: String },
}

/// Errors from policy loading and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Access denied. The reason is safe to return to the application.
    #[error("denied: {reason}")]
    Denied { reason: String },

    /// A policy document is structurally invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// The policy file could not be read.
    #[error("failed to load policies from '{path}': {reason}")]
    Load { path: String, reason: String },
}

/// Errors from bootstrap enrolment and certificate renewal.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// No endpoint was available to open the bootstrap session.
    #[error("bootstrap endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// The bootstrap session could not be established.
    #[error("bootstrap transport error: {0}")]
    Transport(#[from] TransportError),

    /// Keypair generation failed.
    #[error("key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Composing or serializing the CSR failed.
    #[error("csr generation failed: {reason}")]
    Csr { reason: String },

    /// Core rejected the authentication or signing request.
    #[error("core rejected bootstrap '{kind}': {detail}")]
    Rejected { kind: String, detail: String },

    /// No reply arrived within the bootstrap deadline.
    #[error("bootstrap request timed out")]
    Timeout,

    /// An unexpected frame arrived on the bootstrap session.
    #[error("bootstrap protocol error: {reason}")]
    Protocol { reason: String },

    /// Writing an artifact file failed. The partial file was removed.
    #[error("failed to persist '{path}': {reason}")]
    Persist { path: String, reason: String },

    /// The stored certificate could not be parsed.
    #[error("certificate parse error: {reason}")]
    CertParse { reason: String },
}
