//! Network Event Stream
//!
//! Events emitted by the interception handler towards external consumers
//! (event viewer, history store). Emission is best-effort: producers never
//! block on a full channel, so consumers must tolerate gaps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{RuleId, SessionId, Stage, TargetId};

/// Terminal disposition of a matched exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalResult {
    /// A synthetic response was served instead of the origin's.
    Blocked,
    /// The exchange went through with mutations applied.
    Modified,
    /// The exchange went through untouched.
    Passed,
    /// The exchange was failed with a network error reason.
    Failed,
    /// Processing hit a protocol or transport fault.
    Error,
}

/// Summary of one rule that matched, with the action tags that actually
/// executed (a terminal action cuts the remainder short).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub actions: Vec<String>,
}

/// Snapshot of one side of an exchange, captured before and after
/// mutation for the event record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

/// Full record for an exchange that matched at least one rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedEvent {
    pub session: SessionId,
    pub target: TargetId,
    pub url: String,
    pub method: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub timestamp: i64,
    pub final_result: FinalResult,
    pub matched_rules: Vec<RuleMatch>,
    pub original: ExchangeSnapshot,
    pub modified: ExchangeSnapshot,
}

/// Event stream payload, tagged by kind on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NetworkEvent {
    /// Marker: a paused event entered the handler.
    #[serde(rename_all = "camelCase")]
    Intercepted {
        target: TargetId,
        url: String,
        method: String,
        stage: Stage,
        timestamp: i64,
    },
    /// No rule matched; the exchange was continued untouched. Not
    /// persisted by external consumers.
    #[serde(rename_all = "camelCase")]
    Unmatched {
        target: TargetId,
        url: String,
        method: String,
        stage: Stage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        timestamp: i64,
    },
    /// Full record for a matched exchange.
    Matched(Box<MatchedEvent>),
    /// A resource budget was exceeded and the exchange was force-continued.
    #[serde(rename_all = "camelCase")]
    Degraded {
        target: TargetId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        reason: String,
        timestamp: i64,
    },
    /// A per-event fault (body fetch, protocol call) was absorbed.
    #[serde(rename_all = "camelCase")]
    Error {
        target: TargetId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        message: String,
        timestamp: i64,
    },
}

impl NetworkEvent {
    /// Wire tag of the event kind, for logging and filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkEvent::Intercepted { .. } => "intercepted",
            NetworkEvent::Unmatched { .. } => "unmatched",
            NetworkEvent::Matched(_) => "matched",
            NetworkEvent::Degraded { .. } => "degraded",
            NetworkEvent::Error { .. } => "error",
        }
    }
}
