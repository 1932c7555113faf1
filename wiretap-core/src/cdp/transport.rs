//! DevTools WebSocket Transport
//!
//! One transport per attached target (or per lightweight watcher). A
//! single loop task owns the WebSocket connection: it multiplexes command
//! submissions from an mpsc channel against inbound frames, routes command
//! responses back through oneshot responders keyed by call id, and fans
//! protocol events into a bounded channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A protocol event as received from the browser.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
}

/// Seam between the protocol client and the wire. The production
/// implementation is [`WsTransport`]; tests substitute scripted fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a command and wait for its result within `deadline`.
    async fn send(&self, method: &str, params: Value, deadline: Duration) -> CoreResult<Value>;

    /// Next protocol event; `None` once the connection is gone.
    async fn next_event(&self) -> Option<TransportEvent>;

    fn is_alive(&self) -> bool;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}

struct ControlMessage {
    method: String,
    params: Value,
    responder: oneshot::Sender<CoreResult<Value>>,
}

/// WebSocket transport over one DevTools target connection.
pub struct WsTransport {
    command_tx: mpsc::Sender<ControlMessage>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    alive: Arc<AtomicBool>,
    loop_task: JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(ws_url: &str) -> CoreResult<Self> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| CoreError::Transport(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            if let Err(err) = run_loop(conn, command_rx, events_tx).await {
                debug!(target: "wiretap::cdp", error = %err, "connection loop ended");
            }
            loop_alive.store(false, Ordering::Relaxed);
        });

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            alive,
            loop_task,
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, method: &str, params: Value, deadline: Duration) -> CoreResult<Value> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            method: method.to_string(),
            params,
            responder: resp_tx,
        };
        self.command_tx
            .send(message)
            .await
            .map_err(|_| CoreError::Transport("connection closed".into()))?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Transport("command responder dropped".into())),
            Err(_) => Err(CoreError::CommandTimeout(method.to_string())),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}

async fn run_loop(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<ControlMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
) -> CoreResult<()> {
    let mut inflight: HashMap<CallId, oneshot::Sender<CoreResult<Value>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(cmd) => submit(&mut conn, cmd, &mut inflight),
                    // All transport handles dropped.
                    None => return Ok(()),
                }
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => {
                        settle(resp, &mut inflight);
                    }
                    Some(Ok(Message::Event(event))) => {
                        forward(event, &events_tx).await;
                    }
                    Some(Err(err)) => {
                        let transport_err = CoreError::Transport(err.to_string());
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(CoreError::Transport(err.to_string())));
                        }
                        return Err(transport_err);
                    }
                    None => {
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(CoreError::Transport("connection closed".into())));
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn submit(
    conn: &mut Connection<CdpEventMessage>,
    cmd: ControlMessage,
    inflight: &mut HashMap<CallId, oneshot::Sender<CoreResult<Value>>>,
) {
    let method_id: MethodId = cmd.method.clone().into();
    match conn.submit_command(method_id, None, cmd.params) {
        Ok(call_id) => {
            inflight.insert(call_id, cmd.responder);
        }
        Err(err) => {
            let _ = cmd.responder.send(Err(CoreError::Transport(err.to_string())));
        }
    }
}

fn settle(resp: Response, inflight: &mut HashMap<CallId, oneshot::Sender<CoreResult<Value>>>) {
    let Some(sender) = inflight.remove(&resp.id) else {
        return;
    };
    let result = if let Some(result) = resp.result {
        Ok(result)
    } else if let Some(error) = resp.error {
        Err(CoreError::Protocol {
            method: String::new(),
            message: format!("cdp error {}: {}", error.code, error.message),
        })
    } else {
        // A response with neither payload nor error is a bare ack.
        Ok(Value::Object(Default::default()))
    };
    let _ = sender.send(result);
}

async fn forward(event: CdpEventMessage, events_tx: &mpsc::Sender<TransportEvent>) {
    let raw: CdpJsonEventMessage = match event.try_into() {
        Ok(raw) => raw,
        Err(err) => {
            warn!(target: "wiretap::cdp", error = %err, "undecodable protocol event");
            return;
        }
    };
    let payload = TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
    };
    if events_tx.send(payload).await.is_err() {
        debug!(target: "wiretap::cdp", "event consumer gone");
    }
}
