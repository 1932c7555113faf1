//! Protocol Client
//!
//! Thin, typed surface over the transport for the protocol domains this
//! runtime touches: Fetch (interception), Network, and Page lifecycle
//! events for visibility following. Header entries preserve their wire
//! case; lower-casing for matching happens in the evaluation context only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiretap_common::Stage;
use wiretap_rules::ErrorReason;

use crate::cdp::transport::{Transport, TransportEvent, WsTransport};
use crate::error::{CoreError, CoreResult};

/// Default deadline for ordinary protocol commands.
pub const COMMAND_DEADLINE: Duration = Duration::from_secs(10);

/// Body reads block the paused request, so they get a short leash.
pub const BODY_FETCH_DEADLINE: Duration = Duration::from_millis(500);

/// A paused interception event (`Fetch.requestPaused`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PausedEvent {
    pub request_id: String,
    pub request: RequestPayload,
    pub frame_id: String,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status_text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers: Vec<HeaderEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

impl PausedEvent {
    /// A paused event carries a response status only at the response stage.
    pub fn stage(&self) -> Stage {
        if self.response_status_code.is_some() {
            Stage::Response
        } else {
            Stage::Request
        }
    }

    /// Request header lookup, case-insensitive.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Response header lookup, case-insensitive.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn post_data(&self) -> &str {
        self.request.post_data.as_deref().unwrap_or("")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestPayload {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_post_data: Option<bool>,
}

/// Case-preserving header entry as the Fetch domain expects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

pub fn to_header_entries(map: &HashMap<String, String>) -> Vec<HeaderEntry> {
    let mut entries: Vec<HeaderEntry> = map
        .iter()
        .map(|(name, value)| HeaderEntry {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Arguments for `Fetch.continueRequest`. `post_data` carries the raw body;
/// the client base64-encodes it on the wire.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequestArgs {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderEntry>>,
}

impl ContinueRequestArgs {
    pub fn passthrough(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.url.is_none() && self.method.is_none() && self.post_data.is_none() && self.headers.is_none()
    }
}

/// Arguments for `Fetch.fulfillRequest`. `body` carries the raw bytes as a
/// string; the client base64-encodes on the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillRequestArgs {
    pub request_id: String,
    pub response_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<HeaderEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Arguments for `Fetch.continueResponse`. The protocol requires status and
/// headers together whenever either is overridden.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponseArgs {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<HeaderEntry>>,
}

impl ContinueResponseArgs {
    pub fn passthrough(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            ..Self::default()
        }
    }
}

/// `Page.lifecycleEvent` payload, used by target watchers.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    #[serde(default)]
    pub frame_id: String,
    #[serde(default)]
    pub loader_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetResponseBodyReply {
    body: String,
    base64_encoded: bool,
}

/// Typed protocol client bound to one target connection.
pub struct CdpClient {
    transport: Arc<dyn Transport>,
}

impl CdpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn connect(ws_url: &str) -> CoreResult<Self> {
        let transport = WsTransport::connect(ws_url).await?;
        Ok(Self::new(Arc::new(transport)))
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub fn close(&self) {
        self.transport.close();
    }

    async fn send(&self, method: &str, params: Value) -> CoreResult<Value> {
        self.send_with_deadline(method, params, COMMAND_DEADLINE).await
    }

    async fn send_with_deadline(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> CoreResult<Value> {
        match self.transport.send(method, params, deadline).await {
            Err(CoreError::Protocol { message, .. }) => Err(CoreError::Protocol {
                method: method.to_string(),
                message,
            }),
            other => other,
        }
    }

    /// Subscribe to paused events for both stages on every URL.
    pub async fn enable_interception(&self) -> CoreResult<()> {
        self.send("Network.enable", json!({})).await?;
        self.send(
            "Fetch.enable",
            json!({
                "patterns": [
                    { "urlPattern": "*", "requestStage": "Request" },
                    { "urlPattern": "*", "requestStage": "Response" },
                ]
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn disable_interception(&self) -> CoreResult<()> {
        self.send("Fetch.disable", json!({})).await?;
        Ok(())
    }

    /// Next paused event. Lazy and finite: ends with `None` when the
    /// context is cancelled or the transport dies.
    pub async fn next_paused(&self, cancel: &CancellationToken) -> Option<PausedEvent> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return None,
                event = self.transport.next_event() => event?,
            };
            if event.method == "Fetch.requestPaused" {
                match serde_json::from_value::<PausedEvent>(event.params) {
                    Ok(paused) => return Some(paused),
                    Err(err) => {
                        tracing::warn!(target: "wiretap::cdp", error = %err, "malformed paused event");
                    }
                }
            }
        }
    }

    pub async fn continue_request(&self, args: &ContinueRequestArgs) -> CoreResult<()> {
        let mut params = serde_json::to_value(args)
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        if let Some(post_data) = args.post_data.as_deref() {
            params["postData"] = Value::String(BASE64.encode(post_data.as_bytes()));
        }
        self.send("Fetch.continueRequest", params).await?;
        Ok(())
    }

    pub async fn fulfill_request(&self, args: &FulfillRequestArgs) -> CoreResult<()> {
        let mut params = serde_json::to_value(args)
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        if let Some(body) = args.body.as_deref() {
            params["body"] = Value::String(BASE64.encode(body.as_bytes()));
        }
        self.send("Fetch.fulfillRequest", params).await?;
        Ok(())
    }

    pub async fn fail_request(&self, request_id: &str, reason: ErrorReason) -> CoreResult<()> {
        self.send(
            "Fetch.failRequest",
            json!({ "requestId": request_id, "errorReason": reason.as_str() }),
        )
        .await?;
        Ok(())
    }

    pub async fn continue_response(&self, args: &ContinueResponseArgs) -> CoreResult<()> {
        let params = serde_json::to_value(args)
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        self.send("Fetch.continueResponse", params).await?;
        Ok(())
    }

    /// Best-effort body read for a paused response. Bounded by `deadline`
    /// because the request stays paused while the browser streams the body.
    pub async fn get_response_body(
        &self,
        request_id: &str,
        deadline: Duration,
    ) -> CoreResult<String> {
        let reply = self
            .send_with_deadline(
                "Fetch.getResponseBody",
                json!({ "requestId": request_id }),
                deadline,
            )
            .await
            .map_err(|err| match err {
                CoreError::CommandTimeout(_) => CoreError::BodyFetchTimeout,
                other => other,
            })?;
        let reply: GetResponseBodyReply = serde_json::from_value(reply)
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        if reply.base64_encoded {
            let bytes = BASE64
                .decode(reply.body.as_bytes())
                .map_err(|err| CoreError::Transport(format!("body decode: {err}")))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            Ok(reply.body)
        }
    }

    /// Enable page lifecycle events for visibility watching.
    pub async fn enable_page_lifecycle(&self) -> CoreResult<()> {
        self.send("Page.enable", json!({})).await?;
        self.send("Page.setLifecycleEventsEnabled", json!({ "enabled": true }))
            .await?;
        Ok(())
    }

    /// Next lifecycle event; `None` when cancelled or disconnected.
    pub async fn next_lifecycle(&self, cancel: &CancellationToken) -> Option<LifecycleEvent> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return None,
                event = self.transport.next_event() => event?,
            };
            if event.method == "Page.lifecycleEvent" {
                if let Ok(lifecycle) = serde_json::from_value::<LifecycleEvent>(event.params) {
                    return Some(lifecycle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_derives_from_response_status() {
        let mut ev = PausedEvent::default();
        assert_eq!(ev.stage(), Stage::Request);
        ev.response_status_code = Some(200);
        assert_eq!(ev.stage(), Stage::Response);
    }

    #[test]
    fn paused_event_parses_wire_shape() {
        let raw = json!({
            "requestId": "interception-1",
            "request": {
                "url": "https://api.example.com/v1/ping?x=1",
                "method": "POST",
                "headers": { "Content-Type": "application/json" },
                "postData": "{\"a\":1}"
            },
            "frameId": "frame-1",
            "resourceType": "XHR"
        });
        let ev: PausedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ev.request_id, "interception-1");
        assert_eq!(ev.request.method, "POST");
        assert_eq!(ev.request_header("content-type"), Some("application/json"));
        assert_eq!(ev.post_data(), "{\"a\":1}");
        assert_eq!(ev.stage(), Stage::Request);
    }

    #[test]
    fn continue_args_skip_unset_fields() {
        let args = ContinueRequestArgs::passthrough("id-1");
        let params = serde_json::to_value(&args).unwrap();
        assert_eq!(params, json!({ "requestId": "id-1" }));
        assert!(args.is_passthrough());
    }

    #[test]
    fn header_entries_sort_stably() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), "2".to_string());
        map.insert("A".to_string(), "1".to_string());
        let entries = to_header_entries(&map);
        assert_eq!(entries[0].name, "A");
        assert_eq!(entries[1].name, "b");
    }
}
