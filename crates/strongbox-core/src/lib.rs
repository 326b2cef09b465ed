//! Core library for the `Strongbox` on-host agent.
//!
//! Contains the five long-lived components the agent daemon is built from —
//! endpoint manager, connection supervisor, secret cache, lease renewer,
//! and bootstrap — plus the wire protocol, the transport seam, the
//! per-application policy store, and the shared backoff schedules. This
//! crate knows nothing about the UDS listener or process lifecycle; those
//! live in the daemon crate.

pub mod backoff;
pub mod bootstrap;
pub mod cache;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod lease;
pub mod notify;
pub mod policy;
pub mod proto;
pub mod tls;
pub mod transport;
