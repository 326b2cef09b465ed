//! Duplex transport seam between the agent and core.
//!
//! [`Transport`] is one established session's byte pipe; [`CoreConnector`]
//! opens one against a given endpoint. Production uses [`TlsConnector`] /
//! [`TlsTransport`] (mTLS over TCP); tests and embedders use
//! [`MemoryTransport`] pairs handed out by a [`MemoryConnector`], the same
//! way the platform's storage layer ships an in-memory backend.
//!
//! Writes are serialized behind an internal lock so concurrent requesters
//! never interleave frames; reads are expected from a single reader task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_rustls::client::TlsStream;
use rustls_pki_types::ServerName;

use crate::error::TransportError;
use crate::proto::{self, Frame};

/// One established duplex session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame. Serialized internally; safe to call concurrently.
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Receive the next frame. Intended for a single reader task.
    async fn recv(&self) -> Result<Frame, TransportError>;

    /// Close the session. Idempotent.
    async fn close(&self);
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Transport")
    }
}

/// Opens transports against core endpoints.
#[async_trait]
pub trait CoreConnector: Send + Sync {
    /// Open a transport to the given endpoint (`host:port`, optionally
    /// prefixed with `tls://`).
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// TLS transport over TCP, split into independently locked halves.
pub struct TlsTransport {
    reader: Mutex<ReadHalf<TlsStream<TcpStream>>>,
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
}

impl TlsTransport {
    fn new(stream: TlsStream<TcpStream>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        proto::write_frame(&mut *writer, frame).await
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        proto::read_frame(&mut *reader).await
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport").finish_non_exhaustive()
    }
}

/// Production connector: TCP + rustls with the config built from the
/// agent's certificate directory.
pub struct TlsConnector {
    tls: tokio_rustls::TlsConnector,
    connect_timeout: Duration,
}

impl TlsConnector {
    /// Create a connector from a prepared rustls client config.
    #[must_use]
    pub fn new(config: Arc<rustls::ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: tokio_rustls::TlsConnector::from(config),
            connect_timeout,
        }
    }
}

#[async_trait]
impl CoreConnector for TlsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let addr = endpoint.strip_prefix("tls://").unwrap_or(endpoint);
        let (host, _port) =
            addr.rsplit_once(':')
                .ok_or_else(|| TransportError::InvalidEndpoint {
                    endpoint: endpoint.to_owned(),
                    reason: "expected host:port".to_owned(),
                })?;
        let server_name =
            ServerName::try_from(host.to_owned()).map_err(|e| TransportError::InvalidEndpoint {
                endpoint: endpoint.to_owned(),
                reason: e.to_string(),
            })?;

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Connect {
                endpoint: endpoint.to_owned(),
                reason: "connect timed out".to_owned(),
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_owned(),
                reason: e.to_string(),
            })?;

        let stream = tokio::time::timeout(self.connect_timeout, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Connect {
                endpoint: endpoint.to_owned(),
                reason: "tls handshake timed out".to_owned(),
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_owned(),
                reason: format!("tls handshake failed: {e}"),
            })?;

        Ok(Arc::new(TlsTransport::new(stream)))
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// In-memory transport: one side of a crossed pair of unbounded channels.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl MemoryTransport {
    /// Create a connected pair. Frames sent on one side are received on the
    /// other.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(a_rx),
        });
        let b = Arc::new(Self {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(b_rx),
        });
        (a, b)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame.clone()).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        self.tx.lock().await.take();
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish_non_exhaustive()
    }
}

/// Connector handing out pre-queued transports, for tests and embedding.
#[derive(Default)]
pub struct MemoryConnector {
    queue: Mutex<VecDeque<Arc<dyn Transport>>>,
}

impl MemoryConnector {
    /// Create an empty connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport to be handed out by the next `connect` call.
    pub async fn push(&self, transport: Arc<dyn Transport>) {
        self.queue.lock().await.push_back(transport);
    }
}

#[async_trait]
impl CoreConnector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.queue
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| TransportError::Connect {
                endpoint: endpoint.to_owned(),
                reason: "no transport queued".to_owned(),
            })
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::proto::event;

    #[tokio::test]
    async fn memory_pair_delivers_frames_both_ways() {
        let (a, b) = MemoryTransport::pair();

        a.send(&Frame::request(event::HEARTBEAT, serde_json::Value::Null, 1))
            .await
            .unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.event, event::HEARTBEAT);

        b.send(&Frame::push(event::SECRET_ROTATED, serde_json::json!({})))
            .await
            .unwrap();
        let got = a.recv().await.unwrap();
        assert_eq!(got.correlation, None);
    }

    #[tokio::test]
    async fn closed_memory_transport_errors_on_send_and_recv() {
        let (a, b) = MemoryTransport::pair();
        a.close().await;

        let err = a
            .send(&Frame::push(event::HEARTBEAT, serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));

        // The other side sees EOF once the sender is gone.
        let err = b.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn memory_connector_hands_out_queued_transports_in_order() {
        let connector = MemoryConnector::new();
        let (a, _keep_a) = MemoryTransport::pair();
        connector.push(a).await;

        connector.connect("core-1:8700").await.unwrap();
        let err = connector.connect("core-1:8700").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
