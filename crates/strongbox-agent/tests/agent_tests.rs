//! End-to-end tests: a real UDS socket with mutual TLS, a stub core served
//! over an in-memory transport, and framed application requests driven
//! through the full policy/cache/supervisor path.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::net::UnixStream;
use tokio::sync::watch;

use strongbox_core::cache::{CacheOptions, SecretCache};
use strongbox_core::connection::{ConnectionOptions, ConnectionState, ConnectionSupervisor};
use strongbox_core::endpoint::{EndpointManager, EndpointManagerOptions};
use strongbox_core::lease::{LeaseCallbacks, LeaseClient, LeaseRenewer, LeaseRenewerOptions};
use strongbox_core::notify::EventBus;
use strongbox_core::policy::{AppPolicy, PolicyStore};
use strongbox_core::proto::{
    self, AppOp, AppReply, AppRequest, Frame, ReplyEnvelope, ReplyStatus, SecretValue, event,
};
use strongbox_core::transport::{CoreConnector, MemoryConnector, MemoryTransport, Transport};

use strongbox_agent::audit::AuditLog;
use strongbox_agent::identity::IdentityVerifier;
use strongbox_agent::uds::{UdsServer, UdsServerOptions};

const APP_ID: &str = "11111111-1111-1111-1111-111111111111";

/// Throwaway issuing CA for one test environment.
struct TestCa {
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

fn mint_ca() -> TestCa {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    TestCa { cert, key }
}

/// Write the agent's serving identity (SAN `agent`) plus the CA chain.
fn write_agent_identity(dir: &Path, ca: &TestCa) {
    let params = rcgen::CertificateParams::new(vec!["agent".to_owned()]).unwrap();
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();

    std::fs::write(dir.join("ca-chain.pem"), ca.cert.pem()).unwrap();
    std::fs::write(dir.join("agent-cert.pem"), cert.pem()).unwrap();
    std::fs::write(dir.join("agent-key.pem"), key.serialize_pem()).unwrap();
}

/// Write an application client identity with the app ID as CN, optionally
/// carrying the certificate-type extension.
fn write_client_identity(dir: &Path, ca: &TestCa, app_id: &str, with_cert_type: bool) {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, app_id);
    if with_cert_type {
        params
            .custom_extensions
            .push(rcgen::CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 53087, 1, 1],
                b"app_client".to_vec(),
            ));
    }
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();

    std::fs::write(dir.join("ca-chain.pem"), ca.cert.pem()).unwrap();
    std::fs::write(dir.join("agent-cert.pem"), cert.pem()).unwrap();
    std::fs::write(dir.join("agent-key.pem"), key.serialize_pem()).unwrap();
}

/// Core side of the in-memory session: join acknowledgement, static
/// secrets from a map (counting fetches), one dynamic role, renewals.
async fn stub_core(
    transport: Arc<MemoryTransport>,
    secrets: HashMap<String, SecretValue>,
    static_fetches: Arc<AtomicUsize>,
) {
    while let Ok(frame) = transport.recv().await {
        let Some(id) = frame.correlation else { continue };
        let envelope = match frame.event.as_str() {
            event::SESSION_JOIN => ReplyEnvelope::ok(serde_json::json!({})),
            event::GET_STATIC => {
                static_fetches.fetch_add(1, Ordering::SeqCst);
                let path = frame.payload["path"].as_str().unwrap_or_default();
                match secrets.get(path) {
                    Some(secret) => ReplyEnvelope::ok(serde_json::to_value(secret).unwrap()),
                    None => ReplyEnvelope::error("not_found", "no such secret"),
                }
            }
            event::GET_DYNAMIC => ReplyEnvelope::ok(serde_json::json!({
                "credentials": {"username": "v-app-1", "password": "generated"},
                "lease_id": "lease-db-1",
                "lease_duration": 60,
                "renewable": true,
            })),
            event::LEASE_RENEW => ReplyEnvelope::ok(serde_json::json!({
                "lease_duration": 60,
                "renewable": true,
            })),
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

struct Harness {
    socket_path: PathBuf,
    client_tls: Arc<rustls::ClientConfig>,
    static_fetches: Arc<AtomicUsize>,
    renewer: Arc<LeaseRenewer>,
    cache: Arc<SecretCache>,
    shutdown_tx: watch::Sender<bool>,
    ca: TestCa,
    _dirs: Vec<tempfile::TempDir>,
}

async fn harness(policy: AppPolicy, connect_core: bool, max_connections: usize) -> Harness {
    let agent_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    let socket_dir = tempfile::tempdir().unwrap();
    let ca = mint_ca();
    write_agent_identity(agent_dir.path(), &ca);
    write_client_identity(client_dir.path(), &ca, APP_ID, true);

    let socket_path = socket_dir.path().join("agent.sock");

    let endpoints = Arc::new(EndpointManager::new(
        vec!["core-1:8700".to_owned()],
        EndpointManagerOptions::default(),
    ));
    let connector = Arc::new(MemoryConnector::new());
    let static_fetches = Arc::new(AtomicUsize::new(0));

    if connect_core {
        let (agent_side, core_side) = MemoryTransport::pair();
        connector.push(agent_side).await;
        let mut secrets = HashMap::new();
        secrets.insert(
            "prod.db.password".to_owned(),
            SecretValue {
                value: serde_json::json!("s3cret"),
                version: 7,
                metadata: HashMap::new(),
            },
        );
        tokio::spawn(stub_core(
            core_side,
            secrets,
            Arc::clone(&static_fetches),
        ));
    }

    let cache = Arc::new(SecretCache::new(CacheOptions::default()));
    let policies = Arc::new(PolicyStore::new());
    policies.set(APP_ID.parse().unwrap(), policy).await;

    let supervisor = Arc::new(ConnectionSupervisor::new(
        ConnectionOptions {
            agent_id: "agent-e2e".to_owned(),
            ..ConnectionOptions::default()
        },
        endpoints,
        Arc::clone(&connector) as Arc<dyn CoreConnector>,
        Arc::clone(&cache),
        Some(Arc::clone(&policies)),
        EventBus::default(),
    ));
    let renewer = Arc::new(LeaseRenewer::new(
        Arc::clone(&supervisor) as Arc<dyn LeaseClient>,
        LeaseCallbacks::default(),
        LeaseRenewerOptions::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if connect_core {
        tokio::spawn(Arc::clone(&supervisor).run(shutdown_rx.clone()));
        let mut state = supervisor.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *state.borrow_and_update() == ConnectionState::Connected {
                    return;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    let uds = Arc::new(UdsServer::new(
        UdsServerOptions {
            socket_path: socket_path.clone(),
            max_connections,
        },
        strongbox_core::tls::uds_server_config(agent_dir.path()).unwrap(),
        Arc::new(IdentityVerifier::default()),
        policies,
        Arc::clone(&cache),
        supervisor,
        Arc::clone(&renewer),
        Arc::new(AuditLog::new()),
    ));
    let listener = uds.bind().await.unwrap();
    tokio::spawn(uds.run(listener, shutdown_rx));

    let client_tls = strongbox_core::tls::core_client_config(client_dir.path(), true).unwrap();

    Harness {
        socket_path,
        client_tls,
        static_fetches,
        renewer,
        cache,
        shutdown_tx,
        ca,
        _dirs: vec![agent_dir, client_dir, socket_dir],
    }
}

fn full_policy() -> AppPolicy {
    AppPolicy {
        allowed_paths: vec!["prod.db.*".to_owned(), "db.readonly".to_owned()],
        allowed_ops: vec![AppOp::GetSecret, AppOp::GetDynamic, AppOp::Renew],
        ..AppPolicy::default()
    }
}

async fn connect_app(
    harness: &Harness,
) -> tokio_rustls::client::TlsStream<UnixStream> {
    let stream = UnixStream::connect(&harness.socket_path).await.unwrap();
    let connector = tokio_rustls::TlsConnector::from(Arc::clone(&harness.client_tls));
    let name = ServerName::try_from("agent").unwrap();
    connector.connect(name, stream).await.unwrap()
}

async fn call(
    stream: &mut tokio_rustls::client::TlsStream<UnixStream>,
    request: &AppRequest,
) -> AppReply {
    proto::write_frame(stream, request).await.unwrap();
    proto::read_frame(stream).await.unwrap()
}

fn get_secret(path: &str) -> AppRequest {
    AppRequest {
        op: AppOp::GetSecret,
        path: Some(path.to_owned()),
        role: None,
        ttl: None,
        lease_id: None,
    }
}

#[tokio::test]
async fn static_fetch_is_served_and_cached() {
    let h = harness(full_policy(), true, 100).await;
    let mut app = connect_app(&h).await;

    let reply = call(&mut app, &get_secret("prod.db.password")).await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    let data = reply.data.unwrap();
    assert_eq!(data["value"], "s3cret");
    assert_eq!(data["version"], 7);
    assert!(data.get("stale").is_none());

    // Second request within the TTL is a cache hit; core sees one fetch.
    let reply = call(&mut app, &get_secret("prod.db.password")).await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(h.static_fetches.load(Ordering::SeqCst), 1);

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn policy_denies_unlisted_paths_but_connection_survives() {
    let h = harness(full_policy(), true, 100).await;
    let mut app = connect_app(&h).await;

    let reply = call(&mut app, &get_secret("prod.api.key")).await;
    assert_eq!(reply.status, ReplyStatus::Error);
    assert_eq!(reply.reason.as_deref(), Some("denied"));

    // The same connection can still make permitted requests.
    let reply = call(&mut app, &get_secret("prod.db.password")).await;
    assert_eq!(reply.status, ReplyStatus::Ok);

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn stale_entry_is_served_when_core_is_down() {
    let h = harness(full_policy(), false, 100).await;

    // An entry that expired 30 seconds ago, with core unreachable.
    h.cache
        .put(
            "prod.db.password",
            SecretValue {
                value: serde_json::json!("old-value"),
                version: 3,
                metadata: HashMap::new(),
            },
            Some(Duration::ZERO),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut app = connect_app(&h).await;
    let reply = call(&mut app, &get_secret("prod.db.password")).await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    let data = reply.data.unwrap();
    assert_eq!(data["value"], "old-value");
    assert_eq!(data["stale"], true);

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn missing_secret_with_core_down_is_unavailable() {
    let h = harness(full_policy(), false, 100).await;
    let mut app = connect_app(&h).await;

    let reply = call(&mut app, &get_secret("prod.db.password")).await;
    assert_eq!(reply.status, ReplyStatus::Error);
    assert_eq!(reply.reason.as_deref(), Some("unavailable"));

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn dynamic_secret_is_minted_and_lease_tracked() {
    let h = harness(full_policy(), true, 100).await;
    let mut app = connect_app(&h).await;

    let reply = call(
        &mut app,
        &AppRequest {
            op: AppOp::GetDynamic,
            path: None,
            role: Some("db.readonly".to_owned()),
            ttl: Some(60),
            lease_id: None,
        },
    )
    .await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    let data = reply.data.unwrap();
    assert_eq!(data["lease_id"], "lease-db-1");
    assert_eq!(data["credentials"]["username"], "v-app-1");

    // The lease is tracked for proactive renewal.
    let info = h.renewer.status("lease-db-1").await.unwrap();
    assert_eq!(info.secret_path, "db.readonly");

    // And can be renewed on request.
    let reply = call(
        &mut app,
        &AppRequest {
            op: AppOp::Renew,
            path: None,
            role: None,
            ttl: None,
            lease_id: Some("lease-db-1".to_owned()),
        },
    )
    .await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.data.unwrap()["lease_duration"], 60);

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn client_without_cert_type_extension_is_rejected() {
    let h = harness(full_policy(), false, 100).await;

    // Signed by the trusted CA, so the TLS handshake succeeds — but the
    // certificate-type extension is missing, so verification refuses it.
    let bad_dir = tempfile::tempdir().unwrap();
    write_client_identity(bad_dir.path(), &h.ca, APP_ID, false);
    let bad_tls = strongbox_core::tls::core_client_config(bad_dir.path(), true).unwrap();

    let stream = UnixStream::connect(&h.socket_path).await.unwrap();
    let connector = tokio_rustls::TlsConnector::from(bad_tls);
    let name = ServerName::try_from("agent").unwrap();
    let mut stream = connector.connect(name, stream).await.unwrap();

    let reply: AppReply = proto::read_frame(&mut stream).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    let reason = reply.reason.unwrap();
    assert!(reason.starts_with("authentication failed"), "reason: {reason}");

    // The server closes after the rejection reply.
    let next: Result<AppReply, _> = proto::read_frame(&mut stream).await;
    assert!(next.is_err());

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn client_with_non_uuid_cn_is_rejected() {
    let h = harness(full_policy(), false, 100).await;

    let bad_dir = tempfile::tempdir().unwrap();
    write_client_identity(bad_dir.path(), &h.ca, "payments-service", true);
    let bad_tls = strongbox_core::tls::core_client_config(bad_dir.path(), true).unwrap();

    let stream = UnixStream::connect(&h.socket_path).await.unwrap();
    let connector = tokio_rustls::TlsConnector::from(bad_tls);
    let name = ServerName::try_from("agent").unwrap();
    let mut stream = connector.connect(name, stream).await.unwrap();

    let reply: AppReply = proto::read_frame(&mut stream).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    assert!(reply.reason.unwrap().starts_with("authentication failed"));

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn excess_connections_get_too_many_connections() {
    let h = harness(full_policy(), false, 1).await;

    // First connection occupies the single slot.
    let _held = connect_app(&h).await;
    // Give the server a moment to claim the permit.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = connect_app(&h).await;
    let reply: AppReply = proto::read_frame(&mut second).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    assert_eq!(reply.reason.as_deref(), Some("too_many_connections"));

    let _ = h.shutdown_tx.send(true);
}
