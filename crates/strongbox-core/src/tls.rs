//! TLS material loading and rustls config assembly.
//!
//! The agent keeps all of its TLS state in one certificate directory (see
//! [`crate::bootstrap`] for the layout): its own key and certificate plus
//! the trust anchors for core and for local application clients. Both the
//! core-facing client configs and the UDS-facing server config are built
//! from that directory.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::bootstrap::{AGENT_CERT_FILE, AGENT_KEY_FILE, CA_CHAIN_FILE};
use crate::error::TlsError;

/// Load every certificate from a PEM file.
///
/// # Errors
///
/// Returns [`TlsError::Pem`] if the file cannot be read or contains no
/// certificates.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Pem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Pem {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::Pem {
            path: path.display().to_string(),
            reason: "no certificates found".to_owned(),
        });
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// # Errors
///
/// Returns [`TlsError::Pem`] on read failure or [`TlsError::NoPrivateKey`]
/// if the file holds no key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Pem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Pem {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TlsError::NoPrivateKey {
            path: path.display().to_string(),
        })
}

/// Build a root store from a PEM chain file.
///
/// # Errors
///
/// Returns [`TlsError::Pem`] if the file yields no usable trust anchors.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let certs = load_certs(path)?;
    let mut store = RootCertStore::empty();
    for cert in certs {
        store.add(cert).map_err(|e| TlsError::Pem {
            path: path.display().to_string(),
            reason: format!("unusable trust anchor: {e}"),
        })?;
    }
    Ok(store)
}

/// Client config for the agent → core transport.
///
/// With `client_auth` the agent presents its bootstrap certificate (steady
/// state and certificate renewal); without it the connection is
/// server-auth-only (initial bootstrap, where identity is proven by the
/// one-time credentials inside the session instead).
///
/// # Errors
///
/// Returns [`TlsError`] if any PEM file is missing or the rustls config
/// cannot be assembled.
pub fn core_client_config(cert_dir: &Path, client_auth: bool) -> Result<Arc<ClientConfig>, TlsError> {
    let roots = load_root_store(&cert_dir.join(CA_CHAIN_FILE))?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let config = if client_auth {
        let certs = load_certs(&cert_dir.join(AGENT_CERT_FILE))?;
        let key = load_private_key(&cert_dir.join(AGENT_KEY_FILE))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| TlsError::Config {
                reason: format!("client auth cert rejected: {e}"),
            })?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Server config for the UDS listener: the agent's own certificate as the
/// server identity, and mandatory client certificates verified against the
/// CA chain.
///
/// # Errors
///
/// Returns [`TlsError`] if PEM material is missing or the verifier cannot
/// be built.
pub fn uds_server_config(cert_dir: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let roots = load_root_store(&cert_dir.join(CA_CHAIN_FILE))?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::Config {
            reason: format!("client verifier: {e}"),
        })?;

    let certs = load_certs(&cert_dir.join(AGENT_CERT_FILE))?;
    let key = load_private_key(&cert_dir.join(AGENT_KEY_FILE))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config {
            reason: format!("server cert rejected: {e}"),
        })?;

    Ok(Arc::new(config))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_test_pki(dir: &Path) {
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_params = rcgen::CertificateParams::new(vec!["agent".to_owned()]).unwrap();
        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        std::fs::write(dir.join(CA_CHAIN_FILE), ca_cert.pem()).unwrap();
        std::fs::write(dir.join(AGENT_CERT_FILE), leaf_cert.pem()).unwrap();
        std::fs::write(dir.join(AGENT_KEY_FILE), leaf_key.serialize_pem()).unwrap();
    }

    #[test]
    fn builds_client_configs_with_and_without_client_auth() {
        let dir = tempfile::tempdir().unwrap();
        write_test_pki(dir.path());

        core_client_config(dir.path(), true).unwrap();
        core_client_config(dir.path(), false).unwrap();
    }

    #[test]
    fn builds_uds_server_config() {
        let dir = tempfile::tempdir().unwrap();
        write_test_pki(dir.path());

        uds_server_config(dir.path()).unwrap();
    }

    #[test]
    fn missing_ca_chain_is_a_pem_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = core_client_config(dir.path(), false);
        assert!(matches!(result, Err(TlsError::Pem { .. })));
    }

    #[test]
    fn empty_key_file_is_no_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AGENT_KEY_FILE);
        std::fs::write(&path, "").unwrap();
        let result = load_private_key(&path);
        assert!(matches!(result, Err(TlsError::NoPrivateKey { .. })));
    }
}
