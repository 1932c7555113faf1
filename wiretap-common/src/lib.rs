//! Common Domain Types for Wiretap
//!
//! This crate defines the shared vocabulary used across the Wiretap
//! workspace: identifiers, session configuration, target descriptions,
//! engine/pool statistics, pending approval items and the network event
//! stream consumed by external clients (GUI, storage).

pub mod events;

pub use events::{
    ExchangeSnapshot, FinalResult, MatchedEvent, NetworkEvent, RuleMatch,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of one interception session (one DevTools endpoint).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// Identifier of a browser target (tab, worker) as reported by the
/// remote debugging endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

/// Stable identifier of a rule inside a rule set.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Processing stage of an intercepted exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Request,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Request => f.write_str("request"),
            Stage::Response => f.write_str("response"),
        }
    }
}

/// Session configuration supplied by the embedding application.
///
/// Zero values are treated as "unset" and replaced by defaults through
/// [`SessionConfig::normalized`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(rename = "devToolsURL")]
    pub devtools_url: String,

    /// Maximum number of paused events processed concurrently per session.
    #[serde(default)]
    pub concurrency: usize,

    /// Response bodies larger than this many bytes are never fetched.
    #[serde(default)]
    pub body_size_threshold: u64,

    /// Capacity of the pending-approval queue and the event channel.
    #[serde(default)]
    pub pending_capacity: usize,

    /// Per-event processing deadline in milliseconds.
    #[serde(default)]
    pub process_timeout_ms: u64,
}

impl SessionConfig {
    pub const DEFAULT_CONCURRENCY: usize = 32;
    pub const DEFAULT_BODY_SIZE_THRESHOLD: u64 = 2 << 20; // 2 MiB
    pub const DEFAULT_PENDING_CAPACITY: usize = 256;
    pub const DEFAULT_PROCESS_TIMEOUT_MS: u64 = 5000;

    pub fn new(devtools_url: impl Into<String>) -> Self {
        Self {
            devtools_url: devtools_url.into(),
            concurrency: 0,
            body_size_threshold: 0,
            pending_capacity: 0,
            process_timeout_ms: 0,
        }
        .normalized()
    }

    /// Replace unset (zero) fields with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.concurrency == 0 {
            self.concurrency = Self::DEFAULT_CONCURRENCY;
        }
        if self.body_size_threshold == 0 {
            self.body_size_threshold = Self::DEFAULT_BODY_SIZE_THRESHOLD;
        }
        if self.pending_capacity == 0 {
            self.pending_capacity = Self::DEFAULT_PENDING_CAPACITY;
        }
        if self.process_timeout_ms == 0 {
            self.process_timeout_ms = Self::DEFAULT_PROCESS_TIMEOUT_MS;
        }
        self
    }
}

/// One browser target as listed by the remote debugging endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: TargetId,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub title: String,
    pub is_current: bool,
    pub is_user_page: bool,
}

/// Rule engine hit counters. All counters are monotonic.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub evaluated: u64,
    pub matched: u64,
    pub by_rule: HashMap<RuleId, u64>,
}

/// Worker pool counters.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub queue_len: u64,
    pub capacity: u64,
    pub submitted: u64,
    pub dropped: u64,
}

/// A paused event held for human approval.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingItem {
    /// Equals the paused request id; the approval API addresses this.
    pub id: String,
    pub stage: Stage,
    pub url: String,
    pub method: String,
    pub target: TargetId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleId>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_zero_fields() {
        let cfg = SessionConfig::new("http://127.0.0.1:9222");
        assert_eq!(cfg.concurrency, 32);
        assert_eq!(cfg.body_size_threshold, 2 << 20);
        assert_eq!(cfg.pending_capacity, 256);
        assert_eq!(cfg.process_timeout_ms, 5000);
    }

    #[test]
    fn config_keeps_explicit_values() {
        let cfg = SessionConfig {
            devtools_url: "http://127.0.0.1:9222".into(),
            concurrency: 4,
            body_size_threshold: 1024,
            pending_capacity: 8,
            process_timeout_ms: 250,
        }
        .normalized();
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.body_size_threshold, 1024);
        assert_eq!(cfg.pending_capacity, 8);
        assert_eq!(cfg.process_timeout_ms, 250);
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Stage::Request).unwrap(), "\"request\"");
        assert_eq!(serde_json::to_string(&Stage::Response).unwrap(), "\"response\"");
    }
}
