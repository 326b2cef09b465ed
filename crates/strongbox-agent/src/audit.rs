//! Local audit trail of UDS authentication and policy decisions.
//!
//! Every connection rejection and every policy verdict produces a record.
//! Records go to all registered sinks; the trail is fail-open — a broken
//! sink must not take down secret delivery on the host — but persistent
//! sink failures escalate from `warn` to `error` so operators notice.
//!
//! Secret values never appear in records; only app IDs, operations, paths,
//! and reasons.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::AuditError;

/// Outcome of an audited interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The request passed policy and was served (or attempted upstream).
    Granted,
    /// Policy refused the request.
    Denied,
    /// The connection failed certificate verification.
    AuthFailed,
}

/// One audit record, serialized as a JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    /// Application ID, when verification got far enough to know it.
    pub app_id: Option<String>,
    /// Operation name, absent for connection-level events.
    pub op: Option<String>,
    /// Secret path or role, when the request named one.
    pub path: Option<String>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
}

impl AuditRecord {
    /// A record stamped with the current time.
    #[must_use]
    pub fn now(
        app_id: Option<String>,
        op: Option<String>,
        path: Option<String>,
        outcome: AuditOutcome,
        reason: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            app_id,
            op,
            path,
            outcome,
            reason,
        }
    }
}

/// A destination for audit records.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name, for failure reporting.
    fn name(&self) -> &str;

    /// Persist one record.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the record could not be persisted.
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Sink appending JSON lines to a file, opened lazily.
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditSink {
    /// Create a sink writing to the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| AuditError::SinkFailure {
                    name: self.name().to_owned(),
                    reason: format!("open '{}': {e}", self.path.display()),
                })?;
            *guard = Some(file);
        }
        let file = guard.as_mut().ok_or_else(|| AuditError::SinkFailure {
            name: self.name().to_owned(),
            reason: "file handle missing after open".to_owned(),
        })?;

        file.write_all(&line)
            .await
            .map_err(|e| AuditError::SinkFailure {
                name: self.name().to_owned(),
                reason: format!("write: {e}"),
            })?;
        file.flush().await.map_err(|e| AuditError::SinkFailure {
            name: self.name().to_owned(),
            reason: format!("flush: {e}"),
        })
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Consecutive sink failures after which logging escalates to `error`.
const ESCALATION_THRESHOLD: u32 = 5;

/// Fans records out to all sinks, fail-open.
#[derive(Default)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
    consecutive_failures: AtomicU32,
}

impl AuditLog {
    /// An audit log with no sinks (records only reach the process log).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Record an event on every sink. Failures are logged, never surfaced.
    pub async fn record(&self, record: AuditRecord) {
        let mut any_failed = false;
        for sink in &self.sinks {
            if let Err(e) = sink.record(&record).await {
                any_failed = true;
                let failures = self
                    .consecutive_failures
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                if failures >= ESCALATION_THRESHOLD {
                    error!(sink = sink.name(), error = %e, failures, "audit sink persistently failing");
                } else {
                    warn!(sink = sink.name(), error = %e, "audit sink write failed");
                }
            }
        }
        if !any_failed {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}
