//! Wire protocol shared by the core transport and the local UDS listener.
//!
//! Both legs speak length-prefixed JSON: a 4-byte big-endian length followed
//! by one JSON document. On the core leg the document is a [`Frame`] —
//! `{event, payload, ref?}` where `ref` is the correlation ID and is absent
//! on server-initiated pushes. Replies wrap their payload in a
//! [`ReplyEnvelope`] of `{status, response}`.
//!
//! On the UDS leg the documents are [`AppRequest`] / [`AppReply`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Upper bound on a single frame. Secrets are small; anything larger is a
/// protocol violation.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Event names used on the agent ↔ core transport.
pub mod event {
    /// Fetch a static secret by path.
    pub const GET_STATIC: &str = "secrets:get_static";
    /// Mint dynamic credentials for a role.
    pub const GET_DYNAMIC: &str = "secrets:get_dynamic";
    /// Renew a dynamic-credential lease.
    pub const LEASE_RENEW: &str = "lease:renew";
    /// Submit a CSR for signing (bootstrap and renewal).
    pub const CERT_REQUEST: &str = "certificate:request";
    /// One-time credential authentication (bootstrap only).
    pub const AUTHENTICATE: &str = "authenticate";
    /// Steady-state session join handshake.
    pub const SESSION_JOIN: &str = "session:join";
    /// Liveness probe, sent every heartbeat interval.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Push: a secret was rotated upstream.
    pub const SECRET_ROTATED: &str = "secret.rotated";
    /// Push: per-application policies changed.
    pub const POLICY_UPDATED: &str = "policy.updated";
}

/// One message on the core transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Event name; see [`event`].
    pub event: String,
    /// Event payload. For replies this is a [`ReplyEnvelope`].
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Correlation ID. Present on requests and their replies, absent on
    /// pushes.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<u64>,
}

impl Frame {
    /// Build a request frame with a correlation ID.
    #[must_use]
    pub fn request(event: &str, payload: serde_json::Value, correlation: u64) -> Self {
        Self {
            event: event.to_owned(),
            payload,
            correlation: Some(correlation),
        }
    }

    /// Build a push frame (no correlation ID).
    #[must_use]
    pub fn push(event: &str, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_owned(),
            payload,
            correlation: None,
        }
    }
}

/// Reply status discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Envelope carried in the payload of every reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: serde_json::Value,
}

impl ReplyEnvelope {
    /// An `ok` envelope wrapping a response payload.
    #[must_use]
    pub fn ok(response: serde_json::Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response,
        }
    }

    /// An `error` envelope with a categorical kind and detail string.
    #[must_use]
    pub fn error(kind: &str, detail: &str) -> Self {
        Self {
            status: ReplyStatus::Error,
            response: serde_json::json!({ "kind": kind, "detail": detail }),
        }
    }
}

/// Error payload inside an `error` reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
}

/// A static secret as returned by `secrets:get_static` and stored in the
/// cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretValue {
    /// The secret payload. Opaque to the agent; passed through unaltered.
    pub value: serde_json::Value,
    /// Monotonic version assigned by core.
    pub version: u64,
    /// Structured metadata attached by core.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Dynamic credentials as returned by `secrets:get_dynamic`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicSecret {
    /// The minted credentials. Opaque to the agent.
    pub credentials: serde_json::Value,
    /// Lease the credentials are bound to.
    pub lease_id: String,
    /// Lease duration in seconds.
    pub lease_duration: u64,
    /// Whether the lease may be renewed.
    pub renewable: bool,
}

/// Outcome of `lease:renew`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRenewal {
    /// New lease duration in seconds.
    pub lease_duration: u64,
    /// Whether further renewals are permitted.
    pub renewable: bool,
}

/// Reply to `certificate:request`: PEM certificate plus the CA chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub ca_chain: String,
}

/// Payload of a `secret.rotated` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationNotice {
    pub path: String,
    pub new_version: u64,
}

/// Operation requested by a local application over the UDS socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppOp {
    #[serde(rename = "GET_SECRET")]
    GetSecret,
    #[serde(rename = "GET_DYNAMIC")]
    GetDynamic,
    #[serde(rename = "RENEW")]
    Renew,
}

impl AppOp {
    /// Stable lowercase name for logs and audit records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetSecret => "get_secret",
            Self::GetDynamic => "get_dynamic",
            Self::Renew => "renew",
        }
    }
}

/// A framed request from a local application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRequest {
    pub op: AppOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
}

/// A framed reply to a local application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AppReply {
    /// A successful reply carrying data.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            data: Some(data),
            reason: None,
        }
    }

    /// An error reply with a stable reason category.
    #[must_use]
    pub fn error(reason: &str) -> Self {
        Self {
            status: ReplyStatus::Error,
            data: None,
            reason: Some(reason.to_owned()),
        }
    }
}

/// Write one length-prefixed JSON document.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] if the serialized document
/// exceeds [`MAX_FRAME_LEN`], or [`TransportError::Io`] on write failure.
pub async fn write_frame<W, T>(writer: &mut W, document: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(document).map_err(|e| TransportError::Malformed {
        reason: format!("serialization failed: {e}"),
    })?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
        len: body.len(),
        max: MAX_FRAME_LEN,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON document.
///
/// # Errors
///
/// - [`TransportError::Closed`] on clean EOF at a frame boundary.
/// - [`TransportError::FrameTooLarge`] if the announced length exceeds
///   [`MAX_FRAME_LEN`].
/// - [`TransportError::Malformed`] if the body is not the expected JSON.
/// - [`TransportError::Io`] on read failure.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(e) => return Err(TransportError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Malformed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_through_codec() {
        let frame = Frame::request(event::GET_STATIC, serde_json::json!({"path": "a.b"}), 7);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.event, event::GET_STATIC);
        assert_eq!(decoded.correlation, Some(7));
        assert_eq!(decoded.payload["path"], "a.b");
    }

    #[tokio::test]
    async fn push_frame_omits_ref_field() {
        let frame = Frame::push(event::SECRET_ROTATED, serde_json::json!({"path": "a"}));
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        // Skip the 4-byte prefix and inspect the raw JSON.
        let body: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert!(body.get("ref").is_none());
    }

    #[tokio::test]
    async fn oversized_announced_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::try_from(MAX_FRAME_LEN + 1).unwrap().to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Frame, _> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_reads_as_closed() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let result: Result<Frame, _> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn garbage_body_reads_as_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"@@@@");
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Frame, _> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(TransportError::Malformed { .. })));
    }

    #[test]
    fn reply_envelope_error_carries_kind_and_detail() {
        let env = ReplyEnvelope::error("not_found", "no such path");
        assert_eq!(env.status, ReplyStatus::Error);
        let detail: ErrorDetail = serde_json::from_value(env.response).unwrap();
        assert_eq!(detail.kind, "not_found");
        assert_eq!(detail.detail, "no such path");
    }

    #[test]
    fn app_op_serializes_to_screaming_case() {
        let json = serde_json::to_string(&AppOp::GetSecret).unwrap();
        assert_eq!(json, "\"GET_SECRET\"");
        let parsed: AppOp = serde_json::from_str("\"RENEW\"").unwrap();
        assert_eq!(parsed, AppOp::Renew);
    }

    #[test]
    fn app_request_tolerates_missing_optional_fields() {
        let req: AppRequest =
            serde_json::from_str(r#"{"op": "GET_SECRET", "path": "prod.db.password"}"#).unwrap();
        assert_eq!(req.op, AppOp::GetSecret);
        assert_eq!(req.path.as_deref(), Some("prod.db.password"));
        assert!(req.ttl.is_none());
        assert!(req.lease_id.is_none());
    }
}
