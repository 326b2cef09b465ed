//! Per-application access policies for the UDS listener.
//!
//! A policy is keyed by the application's UUID (the CN of its client
//! certificate) and names the secret paths and operations it may use, plus
//! optional TTL and time-of-day conditions. An application without a policy
//! is denied everything.
//!
//! Path patterns are `.`-separated with `*` matching exactly one component
//! (`prod.db.*` matches `prod.db.password` but not `prod.db.a.b`) and `**`
//! matching any suffix. A `deny_paths` match always wins over
//! `allowed_paths`.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::PolicyError;
use crate::proto::AppOp;

/// A time-of-day window in local wall-clock `HH:MM`. Windows where
/// `start > end` wrap around midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

/// Conditional constraints evaluated per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConditions {
    /// Requests are only served inside this window.
    #[serde(default)]
    pub time_of_day: Option<TimeWindow>,
    /// Upper bound on any caller-supplied TTL.
    #[serde(default)]
    pub max_ttl_secs: Option<u64>,
}

/// The access policy of one application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppPolicy {
    /// Patterns the application may read.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Patterns that are always refused, regardless of `allowed_paths`.
    #[serde(default)]
    pub deny_paths: Vec<String>,
    /// Operations the application may invoke.
    #[serde(default)]
    pub allowed_ops: Vec<AppOp>,
    /// Upper bound on any caller-supplied TTL.
    #[serde(default)]
    pub max_ttl_secs: Option<u64>,
    /// Additional request-time conditions.
    #[serde(default)]
    pub conditions: PolicyConditions,
}

/// In-memory policy table, refreshed from disk at startup and from core
/// `policy.updated` pushes thereafter.
pub struct PolicyStore {
    policies: RwLock<HashMap<Uuid, AppPolicy>>,
}

impl PolicyStore {
    /// Create an empty store (denies everything).
    #[must_use]
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Load a store from a JSON file mapping app UUIDs to policies.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Load`] on read failure and
    /// [`PolicyError::Invalid`] on malformed content.
    pub fn load_file(path: &Path) -> Result<Self, PolicyError> {
        let bytes = std::fs::read(path).map_err(|e| PolicyError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let parsed: HashMap<Uuid, AppPolicy> =
            serde_json::from_slice(&bytes).map_err(|e| PolicyError::Invalid {
                reason: format!("policy file '{}': {e}", path.display()),
            })?;
        info!(path = %path.display(), policies = parsed.len(), "policies loaded");
        Ok(Self {
            policies: RwLock::new(parsed),
        })
    }

    /// Install or replace the policy for one application.
    pub async fn set(&self, app_id: Uuid, policy: AppPolicy) {
        self.policies.write().await.insert(app_id, policy);
    }

    /// Remove the policy for one application.
    pub async fn remove(&self, app_id: &Uuid) {
        self.policies.write().await.remove(app_id);
    }

    /// Replace the whole table from a `policy.updated` push payload of the
    /// shape `{"policies": {"<uuid>": {...}}}`. Returns the new table size.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] when the payload does not parse; the
    /// existing table is left untouched.
    pub async fn apply_update(&self, payload: &serde_json::Value) -> Result<usize, PolicyError> {
        let table = payload
            .get("policies")
            .ok_or_else(|| PolicyError::Invalid {
                reason: "missing 'policies' field".to_owned(),
            })?;
        let parsed: HashMap<Uuid, AppPolicy> =
            serde_json::from_value(table.clone()).map_err(|e| PolicyError::Invalid {
                reason: format!("policy update payload: {e}"),
            })?;
        let count = parsed.len();
        *self.policies.write().await = parsed;
        Ok(count)
    }

    /// Number of installed policies.
    pub async fn len(&self) -> usize {
        self.policies.read().await.len()
    }

    /// Whether the store has no policies.
    pub async fn is_empty(&self) -> bool {
        self.policies.read().await.is_empty()
    }

    /// Evaluate a request against the application's policy.
    ///
    /// `path` is `None` for operations with no path to check (a renew of an
    /// untracked lease); the op and condition checks still apply.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Denied`] with a reason safe to show the
    /// application.
    pub async fn check(
        &self,
        app_id: &Uuid,
        op: AppOp,
        path: Option<&str>,
        requested_ttl_secs: Option<u64>,
    ) -> Result<(), PolicyError> {
        let policies = self.policies.read().await;
        let Some(policy) = policies.get(app_id) else {
            return Err(PolicyError::Denied {
                reason: "no policy for application".to_owned(),
            });
        };
        evaluate(policy, op, path, requested_ttl_secs, chrono::Local::now().time())
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

/// Policy evaluation against an explicit wall-clock time.
fn evaluate(
    policy: &AppPolicy,
    op: AppOp,
    path: Option<&str>,
    requested_ttl_secs: Option<u64>,
    now: NaiveTime,
) -> Result<(), PolicyError> {
    if !policy.allowed_ops.contains(&op) {
        return Err(PolicyError::Denied {
            reason: format!("operation '{}' not permitted", op.as_str()),
        });
    }

    if let Some(path) = path {
        if policy.deny_paths.iter().any(|p| path_matches(p, path)) {
            return Err(PolicyError::Denied {
                reason: format!("path '{path}' is denied"),
            });
        }
        if !policy.allowed_paths.iter().any(|p| path_matches(p, path)) {
            return Err(PolicyError::Denied {
                reason: format!("path '{path}' not allowed"),
            });
        }
    }

    if let Some(ttl) = requested_ttl_secs {
        let cap = match (policy.max_ttl_secs, policy.conditions.max_ttl_secs) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(cap) = cap {
            if ttl > cap {
                return Err(PolicyError::Denied {
                    reason: format!("ttl {ttl}s exceeds policy maximum {cap}s"),
                });
            }
        }
    }

    if let Some(window) = &policy.conditions.time_of_day {
        if !within_window(window, now)? {
            return Err(PolicyError::Denied {
                reason: "outside permitted hours".to_owned(),
            });
        }
    }

    Ok(())
}

/// Match a `.`-separated path against a pattern where `*` is a single
/// component and `**` a suffix. Delegates to a glob matcher with the
/// separator mapped to `/` so `*` cannot cross component boundaries.
fn path_matches(pattern: &str, path: &str) -> bool {
    glob_match::glob_match(&pattern.replace('.', "/"), &path.replace('.', "/"))
}

fn within_window(window: &TimeWindow, now: NaiveTime) -> Result<bool, PolicyError> {
    let start = parse_hhmm(&window.start)?;
    let end = parse_hhmm(&window.end)?;
    Ok(if start <= end {
        now >= start && now <= end
    } else {
        // Overnight window, e.g. 22:00–06:00.
        now >= start || now <= end
    })
}

fn parse_hhmm(text: &str) -> Result<NaiveTime, PolicyError> {
    NaiveTime::parse_from_str(text, "%H:%M").map_err(|e| PolicyError::Invalid {
        reason: format!("bad time '{text}': {e}"),
    })
}
