//! Error types for the agent daemon.

use std::path::PathBuf;

use strongbox_core::error::TlsError;

/// Errors from client certificate verification on the UDS listener.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The presented certificate could not be parsed.
    #[error("unparseable client certificate: {reason}")]
    ParseFailed { reason: String },

    /// The certificate is outside its validity window.
    #[error("client certificate outside its validity window")]
    OutsideValidity,

    /// The certificate-type extension is missing.
    #[error("client certificate lacks the certificate-type extension")]
    MissingCertType,

    /// The certificate-type extension names something other than an
    /// application client.
    #[error("client certificate is not an application client certificate")]
    WrongCertType,

    /// The certificate serial is on the revocation list.
    #[error("client certificate revoked (serial {serial})")]
    Revoked { serial: String },

    /// The subject has no common name to carry the app ID.
    #[error("client certificate subject has no common name")]
    MissingCommonName,

    /// The common name is not a hyphenated UUID.
    #[error("client certificate CN '{cn}' is not a valid application id")]
    InvalidAppId { cn: String },

    /// The revocation list file could not be read.
    #[error("failed to load revocation list '{path}': {reason}")]
    RevocationLoad { path: String, reason: String },
}

/// Errors from the UDS listener lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Another process is already serving on the socket path.
    #[error("socket '{path}' is already in use by a live listener")]
    AlreadyInUse { path: PathBuf },

    /// Creating the socket directory or binding the listener failed.
    #[error("failed to bind '{path}': {reason}")]
    Bind { path: PathBuf, reason: String },

    /// Assembling the TLS acceptor failed.
    #[error("uds tls error: {0}")]
    Tls(#[from] TlsError),
}

/// Errors from the local audit trail.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A sink failed to persist a record.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// Serializing the record failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}
