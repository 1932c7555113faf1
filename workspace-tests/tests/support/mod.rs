//! Shared test harness: a scripted transport standing in for the browser
//! connection, plus a handler fixture wired the way the session service
//! wires production sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiretap_common::{NetworkEvent, PendingItem, SessionId};
use wiretap_core::cdp::{Transport, TransportEvent};
use wiretap_core::{ApprovalCoordinator, CdpClient, CoreResult, Handler, HandlerConfig};
use wiretap_rules::{Engine, RuleSet};

/// Transport double: records every command, answers from a script, and
/// feeds protocol events from a channel.
pub struct FakeTransport {
    calls: StdMutex<Vec<(String, Value)>>,
    replies: StdMutex<HashMap<String, Value>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Arc::new(Self {
            calls: StdMutex::new(Vec::new()),
            replies: StdMutex::new(HashMap::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        })
    }

    /// Script the reply for one method.
    pub fn reply(&self, method: &str, value: Value) {
        self.replies.lock().unwrap().insert(method.to_string(), value);
    }

    pub async fn push_event(&self, method: &str, params: Value) {
        self.events_tx
            .send(TransportEvent {
                method: method.to_string(),
                params,
            })
            .await
            .expect("event consumer alive");
    }

    /// Recorded params of every call to `method`, in order.
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls(method).len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, method: &str, params: Value, _deadline: Duration) -> CoreResult<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        let scripted = self.replies.lock().unwrap().get(method).cloned();
        Ok(scripted.unwrap_or_else(|| json!({})))
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn close(&self) {}
}

pub struct Fixture {
    pub transport: Arc<FakeTransport>,
    pub client: Arc<CdpClient>,
    pub handler: Arc<Handler>,
    pub approvals: Arc<ApprovalCoordinator>,
    pub events: mpsc::Receiver<NetworkEvent>,
    pub pending: mpsc::Receiver<PendingItem>,
    pub cancel: CancellationToken,
}

pub fn fixture(rules: Value) -> Fixture {
    fixture_with(rules, 64, Duration::from_secs(5))
}

pub fn fixture_with(rules: Value, event_capacity: usize, process_timeout: Duration) -> Fixture {
    let set: RuleSet =
        serde_json::from_value(json!({ "version": "1", "rules": rules })).expect("valid rule set");
    let engine = Arc::new(Engine::new(&set).expect("compilable rule set"));

    let transport = FakeTransport::new();
    let client = Arc::new(CdpClient::new(transport.clone()));

    let (events_tx, events) = mpsc::channel(event_capacity);
    let (approvals, pending) = ApprovalCoordinator::new(8);
    let approvals = Arc::new(approvals);

    let handler = Arc::new(Handler::new(
        SessionId("test-session".into()),
        engine,
        approvals.clone(),
        events_tx,
        HandlerConfig {
            process_timeout,
            body_size_threshold: 2 << 20,
        },
    ));

    Fixture {
        transport,
        client,
        handler,
        approvals,
        events,
        pending,
        cancel: CancellationToken::new(),
    }
}

pub fn request_paused(request_id: &str, url: &str, method: &str) -> wiretap_core::PausedEvent {
    serde_json::from_value(json!({
        "requestId": request_id,
        "request": {
            "url": url,
            "method": method,
            "headers": { "Accept": "*/*" }
        },
        "frameId": "frame-1",
        "resourceType": "XHR"
    }))
    .expect("valid paused event")
}

pub fn response_paused(
    request_id: &str,
    url: &str,
    status: u16,
    headers: &[(&str, &str)],
) -> wiretap_core::PausedEvent {
    let header_entries: Vec<Value> = headers
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();
    serde_json::from_value(json!({
        "requestId": request_id,
        "request": { "url": url, "method": "GET", "headers": {} },
        "frameId": "frame-1",
        "resourceType": "XHR",
        "responseStatusCode": status,
        "responseHeaders": header_entries
    }))
    .expect("valid paused event")
}

/// Drain whatever events are currently buffered.
pub fn drain_events(rx: &mut mpsc::Receiver<NetworkEvent>) -> Vec<NetworkEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

pub fn header_value(params: &Value, name: &str) -> Option<String> {
    params["headers"]
        .as_array()
        .or_else(|| params["responseHeaders"].as_array())?
        .iter()
        .find(|h| {
            h["name"]
                .as_str()
                .map_or(false, |n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h["value"].as_str().map(String::from))
}
