//! Session Service
//!
//! Process-wide registry of interception sessions. A session wires one
//! DevTools endpoint to a target manager, interceptor, worker pool, rule
//! engine and approval coordinator, and owns the background loops that
//! follow candidate targets and recover broken streams.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use wiretap_common::{
    EngineStats, NetworkEvent, PendingItem, PoolStats, SessionConfig, SessionId, TargetId,
    TargetInfo,
};
use wiretap_rules::{Engine, Rewrite, RuleSet};

use crate::approval::ApprovalCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::handler::{Handler, HandlerConfig};
use crate::interceptor::Interceptor;
use crate::pool::WorkerPool;
use crate::targets::TargetManager;

struct SessionRuntime {
    id: SessionId,
    config: SessionConfig,
    cancel: CancellationToken,
    manager: Arc<TargetManager>,
    interceptor: Arc<Interceptor>,
    handler: Arc<Handler>,
    engine: Arc<Engine>,
    pool: Arc<WorkerPool>,
    approvals: Arc<ApprovalCoordinator>,
    events_rx: Mutex<Option<mpsc::Receiver<NetworkEvent>>>,
    pending_rx: Mutex<Option<mpsc::Receiver<PendingItem>>>,
}

/// The embedding surface: GUI shell and CLI talk to sessions through this.
#[derive(Default)]
pub struct InterceptService {
    sessions: DashMap<SessionId, Arc<SessionRuntime>>,
}

impl InterceptService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session against one DevTools endpoint. Fatal on
    /// configuration errors or an unreachable endpoint; no session is
    /// registered in that case.
    pub async fn start_session(&self, config: SessionConfig) -> CoreResult<SessionId> {
        let config = config.normalized();
        let cancel = CancellationToken::new();

        let (manager, candidates_rx) = TargetManager::new(&config.devtools_url, cancel.clone())?;
        manager.discovery().probe().await?;

        let id = SessionId(Uuid::new_v4().to_string());
        let engine = Arc::new(Engine::empty());
        let (events_tx, events_rx) = mpsc::channel(config.pending_capacity);
        let (approvals, pending_rx) = ApprovalCoordinator::new(config.pending_capacity);
        let approvals = Arc::new(approvals);

        let handler = Arc::new(Handler::new(
            id.clone(),
            engine.clone(),
            approvals.clone(),
            events_tx,
            HandlerConfig {
                process_timeout: std::time::Duration::from_millis(config.process_timeout_ms),
                body_size_threshold: config.body_size_threshold,
            },
        ));

        let pool = Arc::new(WorkerPool::new(config.concurrency, config.pending_capacity));
        let interceptor = Arc::new(Interceptor::new(handler.clone(), Some(pool.clone())));

        let failures_rx = interceptor
            .take_failures()
            .await
            .ok_or_else(|| CoreError::Config("interceptor already wired".into()))?;
        tokio::spawn(follow_loop(
            manager.clone(),
            interceptor.clone(),
            cancel.clone(),
            candidates_rx,
            failures_rx,
        ));

        let runtime = Arc::new(SessionRuntime {
            id: id.clone(),
            config: config.clone(),
            cancel,
            manager,
            interceptor,
            handler,
            engine,
            pool,
            approvals,
            events_rx: Mutex::new(Some(events_rx)),
            pending_rx: Mutex::new(Some(pending_rx)),
        });
        self.sessions.insert(id.clone(), runtime);

        info!(target: "wiretap::service", session = %id, devtools = %config.devtools_url,
              concurrency = config.concurrency, pending = config.pending_capacity,
              "session started");
        Ok(id)
    }

    /// Stop a session: disable interception, drain the pool, detach every
    /// target, release the registry entry.
    pub async fn stop_session(&self, id: &SessionId) -> CoreResult<()> {
        let (_, runtime) = self
            .sessions
            .remove(id)
            .ok_or(CoreError::SessionNotFound)?;

        runtime.interceptor.set_enabled(false);
        for session in runtime.manager.sessions().await {
            if let Err(err) = runtime.interceptor.disable_target(&session).await {
                warn!(target: "wiretap::service", error = %err, "disable on stop failed");
            }
        }
        runtime.cancel.cancel();
        runtime.pool.stop().await;
        runtime.manager.detach_all().await;
        info!(target: "wiretap::service", session = %runtime.id, "session stopped");
        Ok(())
    }

    /// Attach a target; `None` selects the visible user page and enters
    /// auto-follow mode.
    pub async fn attach_target(
        &self,
        id: &SessionId,
        target: Option<TargetId>,
    ) -> CoreResult<TargetId> {
        let runtime = self.runtime(id)?;
        let session = runtime.manager.attach(target).await?;
        if runtime.interceptor.is_enabled() {
            runtime.interceptor.enable_target(&session).await?;
        }
        Ok(session.id.clone())
    }

    pub async fn detach_target(&self, id: &SessionId, target: &TargetId) -> CoreResult<()> {
        let runtime = self.runtime(id)?;
        runtime.manager.detach(target).await;
        Ok(())
    }

    pub async fn list_targets(&self, id: &SessionId) -> CoreResult<Vec<TargetInfo>> {
        self.runtime(id)?.manager.list_targets().await
    }

    /// Turn interception on for every attached target. Idempotent.
    pub async fn enable_interception(&self, id: &SessionId) -> CoreResult<()> {
        let runtime = self.runtime(id)?;
        runtime.interceptor.set_enabled(true);
        for session in runtime.manager.sessions().await {
            if let Err(err) = runtime.interceptor.enable_target(&session).await {
                warn!(target: "wiretap::service", session = %id, target_id = %session.id,
                      error = %err, "enable failed for target");
            }
        }
        info!(target: "wiretap::service", session = %id, "interception enabled");
        Ok(())
    }

    pub async fn disable_interception(&self, id: &SessionId) -> CoreResult<()> {
        let runtime = self.runtime(id)?;
        runtime.interceptor.set_enabled(false);
        for session in runtime.manager.sessions().await {
            if let Err(err) = runtime.interceptor.disable_target(&session).await {
                warn!(target: "wiretap::service", session = %id, target_id = %session.id,
                      error = %err, "disable failed for target");
            }
        }
        runtime.pool.stop().await;
        info!(target: "wiretap::service", session = %id, "interception disabled");
        Ok(())
    }

    /// Install or hot-replace the rule set. Atomic: a rejected set leaves
    /// the previous one running.
    pub async fn load_rules(&self, id: &SessionId, set: &RuleSet) -> CoreResult<()> {
        let runtime = self.runtime(id)?;
        runtime.engine.update(set)?;
        info!(target: "wiretap::service", session = %id, version = %set.version,
              rules = set.rules.len(), "rule set installed");
        Ok(())
    }

    pub fn rule_stats(&self, id: &SessionId) -> CoreResult<EngineStats> {
        Ok(self.runtime(id)?.engine.stats())
    }

    pub fn pool_stats(&self, id: &SessionId) -> CoreResult<PoolStats> {
        Ok(self.runtime(id)?.pool.stats())
    }

    /// Events the slow consumer lost (best-effort channel).
    pub fn dropped_events(&self, id: &SessionId) -> CoreResult<u64> {
        Ok(self.runtime(id)?.handler.dropped_events())
    }

    /// The session's event stream. Single take.
    pub async fn subscribe_events(
        &self,
        id: &SessionId,
    ) -> CoreResult<mpsc::Receiver<NetworkEvent>> {
        self.runtime(id)?
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| CoreError::Config("event stream already subscribed".into()))
    }

    /// The pending-approval queue. Single take.
    pub async fn subscribe_pending(
        &self,
        id: &SessionId,
    ) -> CoreResult<mpsc::Receiver<PendingItem>> {
        self.runtime(id)?
            .pending_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| CoreError::Config("pending queue already subscribed".into()))
    }

    /// Approve a held request-stage exchange with a rewrite. Stale ids
    /// are ignored.
    pub fn approve_request(&self, id: &SessionId, item_id: &str, rewrite: Rewrite) -> CoreResult<bool> {
        Ok(self.runtime(id)?.approvals.approve(item_id, rewrite))
    }

    /// Approve a held response-stage exchange with a rewrite.
    pub fn approve_response(&self, id: &SessionId, item_id: &str, rewrite: Rewrite) -> CoreResult<bool> {
        Ok(self.runtime(id)?.approvals.approve(item_id, rewrite))
    }

    /// Reject a held exchange; it fails with reason `Aborted`.
    pub fn reject(&self, id: &SessionId, item_id: &str) -> CoreResult<bool> {
        Ok(self.runtime(id)?.approvals.reject(item_id))
    }

    pub fn session_config(&self, id: &SessionId) -> CoreResult<SessionConfig> {
        Ok(self.runtime(id)?.config.clone())
    }

    fn runtime(&self, id: &SessionId) -> CoreResult<Arc<SessionRuntime>> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(CoreError::SessionNotFound)
    }
}

/// Background loop per session: attaches auto-follow candidates and
/// re-attaches targets whose paused stream broke.
async fn follow_loop(
    manager: Arc<TargetManager>,
    interceptor: Arc<Interceptor>,
    cancel: CancellationToken,
    mut candidates_rx: mpsc::Receiver<TargetId>,
    mut failures_rx: mpsc::Receiver<TargetId>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            candidate = candidates_rx.recv() => {
                let Some(candidate) = candidate else { break };
                match manager.attach_candidate(candidate.clone()).await {
                    Ok(Some(session)) => {
                        if interceptor.is_enabled() {
                            if let Err(err) = interceptor.enable_target(&session).await {
                                warn!(target: "wiretap::service", target_id = %session.id,
                                      error = %err, "enable after follow failed");
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(target: "wiretap::service", target_id = %candidate, error = %err,
                              "candidate attach failed");
                    }
                }
            }
            failed = failures_rx.recv() => {
                let Some(failed) = failed else { break };
                match manager.recover(&failed).await {
                    Ok(session) => {
                        if interceptor.is_enabled() {
                            if let Err(err) = interceptor.enable_target(&session).await {
                                warn!(target: "wiretap::service", target_id = %session.id,
                                      error = %err, "re-enable after recovery failed");
                            }
                        }
                    }
                    Err(err) => {
                        // Single-shot recovery: surface and quiesce.
                        warn!(target: "wiretap::service", target_id = %failed, error = %err,
                              "stream recovery failed");
                    }
                }
            }
        }
    }
}
