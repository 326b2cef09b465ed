//! Client identity verification for the UDS listener.
//!
//! The TLS handshake already verified the chain against the CA set; this
//! module applies the agent-specific rules on top of the leaf certificate:
//! the validity window, the certificate-type extension, the revocation
//! list, and the app-ID-as-CN convention. The CN must be a strict
//! hyphenated UUID — the same identifier policies are keyed by.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::error::IdentityError;

/// OID of the certificate-type extension stamped onto every certificate
/// the platform issues (private enterprise arc).
pub const CERT_TYPE_OID: &str = "1.3.6.1.4.1.53087.1.1";

/// Extension value marking an application client certificate.
pub const APP_CLIENT_CERT_TYPE: &[u8] = b"app_client";

/// The verified identity of one connected application.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Application ID, extracted from the subject CN.
    pub app_id: Uuid,
    /// SHA-256 fingerprint of the presented certificate (hex).
    pub fingerprint: String,
    /// End of the certificate's validity window.
    pub not_after: DateTime<Utc>,
    /// When this identity was verified.
    pub verified_at: DateTime<Utc>,
}

/// Verifies client certificates beyond chain validation.
#[derive(Debug, Default)]
pub struct IdentityVerifier {
    revoked_serials: HashSet<String>,
}

impl IdentityVerifier {
    /// Create a verifier with an explicit revocation set (lowercase hex
    /// serials).
    #[must_use]
    pub fn new(revoked_serials: HashSet<String>) -> Self {
        Self { revoked_serials }
    }

    /// Load a revocation list: one hex serial per line, `#` comments and
    /// blank lines ignored.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::RevocationLoad`] on read failure.
    pub fn load_revocations(path: &Path) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path).map_err(|e| IdentityError::RevocationLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let revoked_serials = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_lowercase)
            .collect();
        Ok(Self { revoked_serials })
    }

    /// Verify a DER-encoded leaf certificate and extract the identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] naming the first rule the certificate
    /// violates.
    pub fn verify(&self, cert_der: &[u8]) -> Result<ClientIdentity, IdentityError> {
        let (_, cert) =
            X509Certificate::from_der(cert_der).map_err(|e| IdentityError::ParseFailed {
                reason: e.to_string(),
            })?;

        let now = Utc::now().timestamp();
        let validity = cert.validity();
        if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
            return Err(IdentityError::OutsideValidity);
        }

        let cert_type = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == CERT_TYPE_OID)
            .ok_or(IdentityError::MissingCertType)?;
        if cert_type.value != APP_CLIENT_CERT_TYPE {
            return Err(IdentityError::WrongCertType);
        }

        let serial = hex::encode(cert.raw_serial());
        if self.revoked_serials.contains(&serial) {
            return Err(IdentityError::Revoked { serial });
        }

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .ok_or(IdentityError::MissingCommonName)?;
        let app_id = parse_app_id(cn).ok_or_else(|| IdentityError::InvalidAppId {
            cn: cn.to_owned(),
        })?;

        let not_after = Utc
            .timestamp_opt(validity.not_after.timestamp(), 0)
            .single()
            .ok_or(IdentityError::OutsideValidity)?;

        Ok(ClientIdentity {
            app_id,
            fingerprint: hex::encode(Sha256::digest(cert_der)),
            not_after,
            verified_at: Utc::now(),
        })
    }
}

/// Parse a CN as a strict hyphenated UUID
/// (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, case-insensitive). Other UUID
/// spellings (braced, simple, URN) are rejected.
fn parse_app_id(cn: &str) -> Option<Uuid> {
    let bytes = cn.as_bytes();
    if bytes.len() != 36 {
        return None;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return None;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return None;
                }
            }
        }
    }
    Uuid::parse_str(cn).ok()
}
