//! Interceptor
//!
//! One consumer task per attached target reads the paused stream and
//! dispatches each event. Dispatch never blocks the consumer: with a
//! worker pool configured, overflow rejections take the degradation path;
//! without one, every event gets its own task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use wiretap_common::TargetId;

use crate::error::CoreResult;
use crate::handler::Handler;
use crate::pool::WorkerPool;
use crate::targets::TargetSession;

pub struct Interceptor {
    handler: Arc<Handler>,
    pool: Option<Arc<WorkerPool>>,
    enabled: AtomicBool,
    consumers: DashMap<TargetId, ()>,
    failures_tx: mpsc::Sender<TargetId>,
    failures_rx: Mutex<Option<mpsc::Receiver<TargetId>>>,
}

impl Interceptor {
    pub fn new(handler: Arc<Handler>, pool: Option<Arc<WorkerPool>>) -> Self {
        let (failures_tx, failures_rx) = mpsc::channel(16);
        Self {
            handler,
            pool,
            enabled: AtomicBool::new(false),
            consumers: DashMap::new(),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
        }
    }

    /// Stream-failure notifications, one target id per broken stream.
    /// Single take; the session service owns the recovery loop.
    pub async fn take_failures(&self) -> Option<mpsc::Receiver<TargetId>> {
        self.failures_rx.lock().await.take()
    }

    /// The intended interception state. Survives individual target
    /// reconnects: re-attached targets are re-enabled as long as this
    /// is set.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable interception on one target and start its consumer.
    /// Idempotent per target.
    pub async fn enable_target(self: &Arc<Self>, session: &Arc<TargetSession>) -> CoreResult<()> {
        session.client.enable_interception().await?;
        if let Some(pool) = &self.pool {
            pool.start();
        }
        if self
            .consumers
            .insert(session.id.clone(), ())
            .is_none()
        {
            let interceptor = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                interceptor.consume(session).await;
            });
        }
        Ok(())
    }

    /// Disable interception on one target; its consumer stops with the
    /// paused stream.
    pub async fn disable_target(&self, session: &Arc<TargetSession>) -> CoreResult<()> {
        session.client.disable_interception().await
    }

    async fn consume(self: Arc<Self>, session: Arc<TargetSession>) {
        info!(target: "wiretap::interceptor", target_id = %session.id, "consuming paused stream");
        loop {
            match session.client.next_paused(&session.cancel).await {
                Some(ev) => self.dispatch(&session, ev),
                None => break,
            }
        }
        self.consumers.remove(&session.id);

        if session.cancel.is_cancelled() {
            debug!(target: "wiretap::interceptor", target_id = %session.id, "consumer cancelled");
            return;
        }
        warn!(target: "wiretap::interceptor", target_id = %session.id,
              "paused stream broke, requesting recovery");
        if self.failures_tx.try_send(session.id.clone()).is_err() {
            warn!(target: "wiretap::interceptor", target_id = %session.id,
                  "recovery queue full, target stays detached");
        }
    }

    fn dispatch(&self, session: &Arc<TargetSession>, ev: crate::cdp::PausedEvent) {
        let handler = self.handler.clone();
        let client = session.client.clone();
        let cancel = session.cancel.clone();
        let target = session.id.clone();

        match &self.pool {
            None => {
                // Unbounded: one task per paused event.
                tokio::spawn(async move {
                    handler.handle(client, cancel, target, ev).await;
                });
            }
            Some(pool) => {
                let task_handler = handler.clone();
                let task_client = client.clone();
                let task_target = target.clone();
                let task_ev = ev.clone();
                let accepted = pool.submit(async move {
                    task_handler
                        .handle(task_client, cancel, task_target, task_ev)
                        .await;
                });
                if !accepted {
                    tokio::spawn(async move {
                        handler
                            .degrade(&client, &ev, &target, "worker pool overflow")
                            .await;
                    });
                }
            }
        }
    }
}
