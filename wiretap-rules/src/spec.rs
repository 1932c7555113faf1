//! Rule Set Data Model
//!
//! Declarative rules loaded from JSON. A rule binds a condition tree to an
//! ordered action sequence at one stage (request or response). Actions are
//! a tagged enum, so an unknown action tag fails deserialization instead of
//! being skipped silently.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use wiretap_common::{RuleId, Stage};

/// Ordered rule collection with a version tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub stage: Stage,
    /// Higher priority evaluates first; equal priority keeps declaration
    /// order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub when: Condition,
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }
}

/// Condition tree: leaf predicates combined by and/or/not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group {
        op: GroupOp,
        children: Vec<Condition>,
    },
    Leaf(LeafCondition),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
    And,
    Or,
    Not,
}

/// A single predicate over one evaluation-context field.
///
/// Scalar fields: `url`, `method`, `resourceType`, `contentType`, `body`.
/// Named fields: `header:<name>`, `query:<name>`, `cookie:<name>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafCondition {
    pub field: String,
    pub op: LeafOp,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
    /// `"i"` makes regex matching case-insensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeafOp {
    Equals,
    Prefix,
    Suffix,
    Contains,
    Regex,
    Glob,
    InSet,
    GreaterThan,
    LessThan,
}

/// Encoding of body payloads carried inside actions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Utf8,
    Base64,
}

impl BodyEncoding {
    /// Decode an action payload into a working string. Invalid base64 is
    /// passed through verbatim rather than dropping the action.
    pub fn decode(self, value: &str) -> String {
        match self {
            BodyEncoding::Utf8 => value.to_string(),
            BodyEncoding::Base64 => match BASE64.decode(value) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => value.to_string(),
            },
        }
    }
}

fn is_utf8(encoding: &BodyEncoding) -> bool {
    *encoding == BodyEncoding::Utf8
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// One JSON body patch operation at an RFC 6901 pointer path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonPatchOp {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// Network error reasons understood by the browser, used by `fail` actions
/// and pause defaults. Wire names match the protocol verbatim.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorReason {
    Failed,
    Aborted,
    TimedOut,
    AccessDenied,
    ConnectionClosed,
    ConnectionReset,
    ConnectionRefused,
    ConnectionAborted,
    ConnectionFailed,
    NameNotResolved,
    InternetDisconnected,
    AddressUnreachable,
    BlockedByClient,
    BlockedByResponse,
}

impl ErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReason::Failed => "Failed",
            ErrorReason::Aborted => "Aborted",
            ErrorReason::TimedOut => "TimedOut",
            ErrorReason::AccessDenied => "AccessDenied",
            ErrorReason::ConnectionClosed => "ConnectionClosed",
            ErrorReason::ConnectionReset => "ConnectionReset",
            ErrorReason::ConnectionRefused => "ConnectionRefused",
            ErrorReason::ConnectionAborted => "ConnectionAborted",
            ErrorReason::ConnectionFailed => "ConnectionFailed",
            ErrorReason::NameNotResolved => "NameNotResolved",
            ErrorReason::InternetDisconnected => "InternetDisconnected",
            ErrorReason::AddressUnreachable => "AddressUnreachable",
            ErrorReason::BlockedByClient => "BlockedByClient",
            ErrorReason::BlockedByResponse => "BlockedByResponse",
        }
    }
}

/// Default applied when a pause times out or the pending queue overflows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PauseDefault {
    Fulfill { status: u16 },
    Fail { reason: ErrorReason },
    ContinueMutated,
}

/// One action in a rule's ordered action sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    SetUrl {
        value: String,
    },
    SetMethod {
        value: String,
    },
    SetHeader {
        name: String,
        value: String,
    },
    RemoveHeader {
        name: String,
    },
    SetQueryParam {
        name: String,
        value: String,
    },
    RemoveQueryParam {
        name: String,
    },
    SetCookie {
        name: String,
        value: String,
    },
    RemoveCookie {
        name: String,
    },
    SetBody {
        value: String,
        #[serde(default, skip_serializing_if = "is_utf8")]
        encoding: BodyEncoding,
    },
    AppendBody {
        value: String,
        #[serde(default, skip_serializing_if = "is_utf8")]
        encoding: BodyEncoding,
    },
    #[serde(rename_all = "camelCase")]
    ReplaceBodyText {
        search: String,
        replace: String,
        #[serde(default, skip_serializing_if = "is_false")]
        replace_all: bool,
    },
    PatchBodyJson {
        patches: Vec<JsonPatchOp>,
    },
    SetFormField {
        name: String,
        value: String,
    },
    RemoveFormField {
        name: String,
    },
    /// Response stage only.
    SetStatus {
        value: u16,
    },
    /// Sleep before resolving the exchange, bounded by the event deadline.
    #[serde(rename_all = "camelCase")]
    Delay {
        delay_ms: u64,
    },
    /// Probabilistically skip rule processing for this exchange.
    Drop {
        rate: f64,
    },
    /// Terminal: serve a synthetic rejection (request stage).
    Block {
        status: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
        #[serde(default, skip_serializing_if = "is_utf8")]
        encoding: BodyEncoding,
    },
    /// Terminal: fail with a network error reason.
    Fail {
        reason: ErrorReason,
    },
    /// Terminal: serve a full synthetic response.
    Fulfill {
        status: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
        #[serde(default, skip_serializing_if = "is_utf8")]
        encoding: BodyEncoding,
    },
    /// Terminal: hold for human approval.
    #[serde(rename_all = "camelCase")]
    Pause {
        timeout_ms: u64,
        default: PauseDefault,
    },
}

impl Action {
    /// Wire tag of the action, recorded in event rule summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            Action::SetUrl { .. } => "setUrl",
            Action::SetMethod { .. } => "setMethod",
            Action::SetHeader { .. } => "setHeader",
            Action::RemoveHeader { .. } => "removeHeader",
            Action::SetQueryParam { .. } => "setQueryParam",
            Action::RemoveQueryParam { .. } => "removeQueryParam",
            Action::SetCookie { .. } => "setCookie",
            Action::RemoveCookie { .. } => "removeCookie",
            Action::SetBody { .. } => "setBody",
            Action::AppendBody { .. } => "appendBody",
            Action::ReplaceBodyText { .. } => "replaceBodyText",
            Action::PatchBodyJson { .. } => "patchBodyJson",
            Action::SetFormField { .. } => "setFormField",
            Action::RemoveFormField { .. } => "removeFormField",
            Action::SetStatus { .. } => "setStatus",
            Action::Delay { .. } => "delay",
            Action::Drop { .. } => "drop",
            Action::Block { .. } => "block",
            Action::Fail { .. } => "fail",
            Action::Fulfill { .. } => "fulfill",
            Action::Pause { .. } => "pause",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Action::Block { .. } | Action::Fail { .. } | Action::Fulfill { .. } | Action::Pause { .. }
        )
    }
}

/// Mutation deposit supplied by the approval API. Mirrors the request
/// mutation fields; an empty rewrite means "continue as accumulated".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rewrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_query: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cookies: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_cookies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Rewrite {
    pub fn is_noop(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.headers.is_empty()
            && self.remove_headers.is_empty()
            && self.query.is_empty()
            && self.remove_query.is_empty()
            && self.cookies.is_empty()
            && self.remove_cookies.is_empty()
            && self.body.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_set() -> serde_json::Value {
        json!({
            "version": "1",
            "rules": [
                {
                    "id": "r1",
                    "name": "trace header",
                    "stage": "request",
                    "when": {"field": "url", "op": "prefix", "value": "https://api.example.com"},
                    "actions": [
                        {"type": "setHeader", "name": "X-Trace", "value": "abc"}
                    ]
                },
                {
                    "id": "r2",
                    "name": "block ads",
                    "stage": "request",
                    "priority": 5,
                    "when": {
                        "op": "and",
                        "children": [
                            {"field": "url", "op": "contains", "value": "/ads/"},
                            {"op": "not", "children": [
                                {"field": "method", "op": "equals", "value": "OPTIONS"}
                            ]}
                        ]
                    },
                    "actions": [
                        {"type": "block", "status": 403, "body": "blocked"}
                    ]
                }
            ]
        })
    }

    #[test]
    fn parse_reserialize_is_identity() {
        let raw = sample_set();
        let set: RuleSet = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&set).unwrap();
        assert_eq!(raw, back);
    }

    #[test]
    fn unknown_action_tag_fails_load() {
        let raw = json!({
            "version": "1",
            "rules": [{
                "id": "r1",
                "name": "x",
                "stage": "request",
                "when": {"field": "url", "op": "contains", "value": "x"},
                "actions": [{"type": "teleport", "value": "moon"}]
            }]
        });
        assert!(serde_json::from_value::<RuleSet>(raw).is_err());
    }

    #[test]
    fn pause_action_round_trips() {
        let raw = json!({
            "type": "pause",
            "timeoutMs": 5000,
            "default": {"type": "fail", "reason": "Aborted"}
        });
        let action: Action = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(
            action,
            Action::Pause {
                timeout_ms: 5000,
                default: PauseDefault::Fail {
                    reason: ErrorReason::Aborted
                }
            }
        );
        assert_eq!(serde_json::to_value(&action).unwrap(), raw);
    }

    #[test]
    fn condition_groups_and_leaves_disambiguate() {
        let leaf: Condition =
            serde_json::from_value(json!({"field": "method", "op": "equals", "value": "GET"}))
                .unwrap();
        assert!(matches!(leaf, Condition::Leaf(_)));

        let group: Condition = serde_json::from_value(json!({
            "op": "or",
            "children": [
                {"field": "url", "op": "glob", "value": "*.png"},
                {"field": "url", "op": "suffix", "value": ".jpg"}
            ]
        }))
        .unwrap();
        match group {
            Condition::Group { op, children } => {
                assert_eq!(op, GroupOp::Or);
                assert_eq!(children.len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn base64_payloads_decode() {
        assert_eq!(BodyEncoding::Base64.decode("aGVsbG8="), "hello");
        assert_eq!(BodyEncoding::Utf8.decode("hello"), "hello");
        // invalid base64 passes through
        assert_eq!(BodyEncoding::Base64.decode("!!!"), "!!!");
    }

    #[test]
    fn rewrite_noop_detection() {
        assert!(Rewrite::default().is_noop());
        let rw = Rewrite {
            method: Some("POST".into()),
            ..Rewrite::default()
        };
        assert!(!rw.is_noop());
    }
}
