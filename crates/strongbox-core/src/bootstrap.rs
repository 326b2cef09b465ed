//! Bootstrap enrolment: one-time credentials in, durable client
//! certificate out.
//!
//! Enrolment generates a fresh ECDSA P-256 keypair, composes a CSR for the
//! agent's identity, opens a temporary session to core authenticated by the
//! one-time `(role_id, secret_id)` pair, and exchanges the CSR for a signed
//! certificate plus the CA chain. Renewal runs the same flow over a session
//! authenticated by the current client certificate.
//!
//! Artifacts are staged with their final permissions and renamed into place
//! only once every write succeeded, so no partial or world-readable state
//! is ever observable. The key PEM is zeroized after it hits disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::endpoint::EndpointManager;
use crate::error::BootstrapError;
use crate::proto::{
    ErrorDetail, Frame, IssuedCertificate, ReplyEnvelope, ReplyStatus, event,
};
use crate::transport::{CoreConnector, Transport};

/// Private key artifact, mode 0600.
pub const AGENT_KEY_FILE: &str = "agent-key.pem";
/// Client certificate artifact, mode 0600.
pub const AGENT_CERT_FILE: &str = "agent-cert.pem";
/// Trust anchor artifact, mode 0644.
pub const CA_CHAIN_FILE: &str = "ca-chain.pem";

/// Remaining certificate lifetime under which re-bootstrap is required.
const RENEW_WINDOW_SECS: i64 = 7 * 24 * 3600;

/// Tuning knobs for bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Identity placed in the CSR subject CN and SAN.
    pub agent_id: String,
    /// Organization placed in the CSR subject.
    pub organization: String,
    /// Directory the artifacts are written to.
    pub cert_dir: PathBuf,
    /// Deadline for each bootstrap exchange.
    pub request_timeout: Duration,
}

impl BootstrapOptions {
    /// Defaults with the given identity and directory.
    #[must_use]
    pub fn new(agent_id: String, organization: String, cert_dir: PathBuf) -> Self {
        Self {
            agent_id,
            organization,
            cert_dir,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Metadata of the persisted certificate artifacts.
#[derive(Debug, Clone)]
pub struct BootstrapArtifact {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub ca_path: PathBuf,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Runs enrolment and renewal against core.
pub struct Bootstrapper {
    opts: BootstrapOptions,
    endpoints: Arc<EndpointManager>,
}

impl Bootstrapper {
    /// Create a bootstrapper.
    #[must_use]
    pub fn new(opts: BootstrapOptions, endpoints: Arc<EndpointManager>) -> Self {
        Self { opts, endpoints }
    }

    /// Exchange one-time credentials for a signed client certificate.
    ///
    /// `connector` must not present a client certificate; identity is
    /// proven by the credentials inside the session.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`]; on any failure no partial artifact
    /// files remain on disk.
    pub async fn enrol(
        &self,
        connector: &dyn CoreConnector,
        role_id: &str,
        secret_id: &str,
    ) -> Result<BootstrapArtifact, BootstrapError> {
        let endpoint = self.endpoints.next().await?;
        let transport = match connector.connect(&endpoint).await {
            Ok(t) => {
                self.endpoints.report_success(&endpoint).await;
                t
            }
            Err(e) => {
                self.endpoints.report_failure(&endpoint).await;
                return Err(e.into());
            }
        };

        info!(endpoint = %endpoint, agent_id = %self.opts.agent_id, "bootstrap session opened");
        let result = self
            .authenticate_and_issue(&transport, role_id, secret_id)
            .await;
        transport.close().await;
        result
    }

    /// Renew the client certificate over a session authenticated with the
    /// current certificate.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`enrol`](Self::enrol).
    pub async fn renew(
        &self,
        connector: &dyn CoreConnector,
    ) -> Result<BootstrapArtifact, BootstrapError> {
        let endpoint = self.endpoints.next().await?;
        let transport = connector.connect(&endpoint).await?;

        info!(endpoint = %endpoint, agent_id = %self.opts.agent_id, "certificate renewal session opened");
        let join = exchange(
            transport.as_ref(),
            event::SESSION_JOIN,
            json!({ "agent_id": self.opts.agent_id }),
            1,
            self.opts.request_timeout,
        )
        .await;
        let result = match join {
            Ok(_) => self.issue(transport.as_ref(), 2).await,
            Err(e) => Err(e),
        };
        transport.close().await;
        result
    }

    async fn authenticate_and_issue(
        &self,
        transport: &Arc<dyn Transport>,
        role_id: &str,
        secret_id: &str,
    ) -> Result<BootstrapArtifact, BootstrapError> {
        // The secret ID goes on the wire and nowhere else; it is never
        // logged.
        exchange(
            transport.as_ref(),
            event::AUTHENTICATE,
            json!({ "role_id": role_id, "secret_id": secret_id }),
            1,
            self.opts.request_timeout,
        )
        .await?;
        info!(agent_id = %self.opts.agent_id, "bootstrap credentials accepted");
        self.issue(transport.as_ref(), 2).await
    }

    /// Generate the keypair, exchange the CSR, persist the artifacts.
    async fn issue(
        &self,
        transport: &dyn Transport,
        correlation: u64,
    ) -> Result<BootstrapArtifact, BootstrapError> {
        let key_pair = rcgen::KeyPair::generate().map_err(|e| BootstrapError::KeyGeneration {
            reason: e.to_string(),
        })?;
        let csr_pem = build_csr(&key_pair, &self.opts.agent_id, &self.opts.organization)?;

        let response = exchange(
            transport,
            event::CERT_REQUEST,
            json!({ "csr": csr_pem }),
            correlation,
            self.opts.request_timeout,
        )
        .await?;
        let issued: IssuedCertificate =
            serde_json::from_value(response).map_err(|e| BootstrapError::Protocol {
                reason: format!("bad certificate reply: {e}"),
            })?;

        let key_pem = Zeroizing::new(key_pair.serialize_pem());
        persist_artifacts(
            &self.opts.cert_dir,
            key_pem.as_bytes(),
            issued.certificate.as_bytes(),
            issued.ca_chain.as_bytes(),
        )?;

        let artifact = inspect_certificate(&self.opts.cert_dir)?;
        info!(
            serial = %artifact.serial,
            not_after = %artifact.not_after,
            "client certificate installed"
        );
        Ok(artifact)
    }
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("agent_id", &self.opts.agent_id)
            .finish_non_exhaustive()
    }
}

/// Whether the agent must (re-)bootstrap before steady-state operation:
/// key or cert missing, cert unparseable, or cert expiring within the
/// renewal window.
#[must_use]
pub fn needs_bootstrap(cert_dir: &Path) -> bool {
    if !cert_dir.join(AGENT_KEY_FILE).exists() {
        return true;
    }
    match inspect_certificate(cert_dir) {
        Ok(status) => {
            let remaining = status.not_after.timestamp() - Utc::now().timestamp();
            if remaining < RENEW_WINDOW_SECS {
                warn!(
                    not_after = %status.not_after,
                    "client certificate expires soon, re-bootstrap required"
                );
                true
            } else {
                false
            }
        }
        Err(e) => {
            warn!(error = %e, "client certificate unusable, re-bootstrap required");
            true
        }
    }
}

/// Parse the persisted certificate and report its identity window.
///
/// # Errors
///
/// Returns [`BootstrapError::CertParse`] when the file is missing or not a
/// valid X.509 PEM.
pub fn inspect_certificate(cert_dir: &Path) -> Result<BootstrapArtifact, BootstrapError> {
    let cert_path = cert_dir.join(AGENT_CERT_FILE);
    let bytes = std::fs::read(&cert_path).map_err(|e| BootstrapError::CertParse {
        reason: format!("read '{}': {e}", cert_path.display()),
    })?;
    let (_, pem) =
        x509_parser::pem::parse_x509_pem(&bytes).map_err(|e| BootstrapError::CertParse {
            reason: format!("bad PEM: {e}"),
        })?;
    let cert = pem.parse_x509().map_err(|e| BootstrapError::CertParse {
        reason: format!("bad certificate: {e}"),
    })?;

    let not_before = Utc
        .timestamp_opt(cert.validity().not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| BootstrapError::CertParse {
            reason: "not_before out of range".to_owned(),
        })?;
    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| BootstrapError::CertParse {
            reason: "not_after out of range".to_owned(),
        })?;

    Ok(BootstrapArtifact {
        key_path: cert_dir.join(AGENT_KEY_FILE),
        cert_path,
        ca_path: cert_dir.join(CA_CHAIN_FILE),
        serial: hex::encode(cert.raw_serial()),
        not_before,
        not_after,
    })
}

/// Compose a CSR with `O=<org>, CN=<agent_id>` and SANs
/// `DNS:<agent_id>, DNS:agent`.
fn build_csr(
    key_pair: &rcgen::KeyPair,
    agent_id: &str,
    organization: &str,
) -> Result<String, BootstrapError> {
    let mut params =
        rcgen::CertificateParams::new(vec![agent_id.to_owned(), "agent".to_owned()]).map_err(
            |e| BootstrapError::Csr {
                reason: format!("params: {e}"),
            },
        )?;
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, organization);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, agent_id);

    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| BootstrapError::Csr {
            reason: format!("signing: {e}"),
        })?;
    csr.pem().map_err(|e| BootstrapError::Csr {
        reason: format!("encoding: {e}"),
    })
}

/// One correlated request/reply exchange on a bootstrap session. Pushes
/// arriving in between are skipped.
async fn exchange(
    transport: &dyn Transport,
    event_name: &str,
    payload: serde_json::Value,
    correlation: u64,
    deadline: Duration,
) -> Result<serde_json::Value, BootstrapError> {
    transport
        .send(&Frame::request(event_name, payload, correlation))
        .await?;

    let reply = tokio::time::timeout(deadline, async {
        loop {
            let frame = transport.recv().await?;
            if frame.correlation == Some(correlation) {
                return Ok::<Frame, BootstrapError>(frame);
            }
        }
    })
    .await
    .map_err(|_| BootstrapError::Timeout)??;

    let envelope: ReplyEnvelope =
        serde_json::from_value(reply.payload).map_err(|e| BootstrapError::Protocol {
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
            Err(BootstrapError::Rejected {
                kind: detail.kind,
                detail: detail.detail,
            })
        }
    }
}

/// Stage all three artifacts with final permissions, then rename them into
/// place. On any failure the staged files are removed and nothing final is
/// touched.
fn persist_artifacts(
    cert_dir: &Path,
    key_pem: &[u8],
    cert_pem: &[u8],
    ca_pem: &[u8],
) -> Result<(), BootstrapError> {
    let staged = [
        (AGENT_KEY_FILE, key_pem, 0o600),
        (AGENT_CERT_FILE, cert_pem, 0o600),
        (CA_CHAIN_FILE, ca_pem, 0o644),
    ];

    let mut tmp_paths = Vec::with_capacity(staged.len());
    for (name, bytes, mode) in staged {
        match stage_file(cert_dir, name, bytes, mode) {
            Ok(tmp) => tmp_paths.push((tmp, cert_dir.join(name))),
            Err(e) => {
                remove_staged(&tmp_paths);
                return Err(e);
            }
        }
    }

    for (tmp, final_path) in &tmp_paths {
        if let Err(e) = std::fs::rename(tmp, final_path) {
            remove_staged(&tmp_paths);
            return Err(BootstrapError::Persist {
                path: final_path.display().to_string(),
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}

/// Write bytes to `<name>.tmp` with the final mode already applied.
fn stage_file(
    dir: &Path,
    name: &str,
    bytes: &[u8],
    mode: u32,
) -> Result<PathBuf, BootstrapError> {
    use std::io::Write;

    let tmp = dir.join(format!("{name}.tmp"));
    let persist_err = |e: std::io::Error| BootstrapError::Persist {
        path: tmp.display().to_string(),
        reason: e.to_string(),
    };

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp).map_err(persist_err)?;
    // The mode on open only applies to newly created files; enforce it on
    // reused temp files too before any sensitive bytes are written.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(persist_err)?;
    }
    file.write_all(bytes).map_err(persist_err)?;
    file.sync_all().map_err(persist_err)?;
    Ok(tmp)
}

fn remove_staged(tmp_paths: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in tmp_paths {
        let _ = std::fs::remove_file(tmp);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointManagerOptions;
    use crate::transport::{MemoryConnector, MemoryTransport};

    fn options(dir: &Path) -> BootstrapOptions {
        BootstrapOptions::new(
            "agent-7f".to_owned(),
            "Strongbox".to_owned(),
            dir.to_path_buf(),
        )
    }

    fn endpoints() -> Arc<EndpointManager> {
        Arc::new(EndpointManager::new(
            vec!["core-1:8700".to_owned()],
            EndpointManagerOptions::default(),
        ))
    }

    /// Core side of a bootstrap session: accept any credentials, sign the
    /// CSR with a throwaway CA.
    async fn stub_signing_core(transport: Arc<MemoryTransport>) {
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        while let Ok(frame) = transport.recv().await {
            let Some(id) = frame.correlation else { continue };
            let envelope = match frame.event.as_str() {
                event::AUTHENTICATE | event::SESSION_JOIN => {
                    ReplyEnvelope::ok(serde_json::json!({}))
                }
                event::CERT_REQUEST => {
                    let csr_pem = frame.payload["csr"].as_str().unwrap();
                    let csr =
                        rcgen::CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
                    let cert = csr.signed_by(&ca_cert, &ca_key).unwrap();
                    ReplyEnvelope::ok(serde_json::json!({
                        "certificate": cert.pem(),
                        "ca_chain": ca_cert.pem(),
                    }))
                }
                _ => continue,
            };
            let reply = Frame {
                event: format!("{}:reply", frame.event),
                payload: serde_json::to_value(&envelope).unwrap(),
                correlation: Some(id),
            };
            if transport.send(&reply).await.is_err() {
                return;
            }
        }
    }

    #[test]
    fn csr_carries_subject_and_pem_armor() {
        let key = rcgen::KeyPair::generate().unwrap();
        let pem = build_csr(&key, "agent-7f", "Strongbox").unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE REQUEST"));
    }

    #[tokio::test]
    async fn enrol_persists_artifacts_with_restrictive_modes() {
        let dir = tempfile::tempdir().unwrap();
        let (agent_side, core_side) = MemoryTransport::pair();
        let connector = MemoryConnector::new();
        connector.push(agent_side).await;
        tokio::spawn(stub_signing_core(core_side));

        let bootstrapper = Bootstrapper::new(options(dir.path()), endpoints());
        let artifact = bootstrapper
            .enrol(&connector, "role-1", "one-time-secret")
            .await
            .unwrap();

        assert!(artifact.key_path.exists());
        assert!(artifact.cert_path.exists());
        assert!(artifact.ca_path.exists());
        assert!(!artifact.serial.is_empty());
        assert!(artifact.not_after > Utc::now());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let key_mode =
                std::fs::metadata(&artifact.key_path).unwrap().permissions().mode() & 0o777;
            assert_eq!(key_mode, 0o600);
            let ca_mode =
                std::fs::metadata(&artifact.ca_path).unwrap().permissions().mode() & 0o777;
            assert_eq!(ca_mode, 0o644);
        }

        // No staging residue.
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().ends_with(".tmp"));
        }

        assert!(!needs_bootstrap(dir.path()));
    }

    #[tokio::test]
    async fn rejected_credentials_leave_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let (agent_side, core_side) = MemoryTransport::pair();
        let connector = MemoryConnector::new();
        connector.push(agent_side).await;

        tokio::spawn(async move {
            while let Ok(frame) = core_side.recv().await {
                let Some(id) = frame.correlation else { continue };
                let envelope = ReplyEnvelope::error("denied", "bad credentials");
                let reply = Frame {
                    event: "authenticate:reply".to_owned(),
                    payload: serde_json::to_value(&envelope).unwrap(),
                    correlation: Some(id),
                };
                let _ = core_side.send(&reply).await;
            }
        });

        let bootstrapper = Bootstrapper::new(options(dir.path()), endpoints());
        let err = bootstrapper
            .enrol(&connector, "role-1", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Rejected { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn needs_bootstrap_when_files_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(needs_bootstrap(dir.path()));
    }

    #[test]
    fn needs_bootstrap_when_cert_is_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(AGENT_KEY_FILE), "key").unwrap();
        std::fs::write(dir.path().join(AGENT_CERT_FILE), "not a pem").unwrap();
        assert!(needs_bootstrap(dir.path()));
    }

    #[test]
    fn needs_bootstrap_when_cert_expires_soon() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["agent".to_owned()]).unwrap();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        std::fs::write(dir.path().join(AGENT_KEY_FILE), key.serialize_pem()).unwrap();
        std::fs::write(dir.path().join(AGENT_CERT_FILE), cert.pem()).unwrap();
        assert!(needs_bootstrap(dir.path()));
    }

    #[test]
    fn long_lived_cert_does_not_need_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["agent".to_owned()]).unwrap();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        std::fs::write(dir.path().join(AGENT_KEY_FILE), key.serialize_pem()).unwrap();
        std::fs::write(dir.path().join(AGENT_CERT_FILE), cert.pem()).unwrap();
        assert!(!needs_bootstrap(dir.path()));
    }

    #[test]
    fn persist_failure_removes_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = persist_artifacts(&missing, b"k", b"c", b"a").unwrap_err();
        assert!(matches!(err, BootstrapError::Persist { .. }));
        assert!(!missing.exists());
    }
}
