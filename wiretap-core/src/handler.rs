//! Paused-Event Handler
//!
//! Orchestrates one paused event from arrival to its terminal protocol
//! call: builds the evaluation context, runs the engine, defers to the
//! executor for composition, coordinates approvals, and emits the event
//! stream. Every path out of [`Handler::handle`] resolves the paused
//! request exactly once, inside the per-event deadline or through the
//! degradation path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wiretap_common::{
    FinalResult, MatchedEvent, NetworkEvent, PendingItem, RuleId, SessionId, Stage, TargetId,
};
use wiretap_rules::{
    parse_set_cookie, Action, ContextSeed, Engine, ErrorReason, EvalContext, MatchedRule,
    PauseDefault,
};

use crate::approval::{ApprovalCoordinator, Decision};
use crate::cdp::{
    CdpClient, ContinueRequestArgs, ContinueResponseArgs, FulfillRequestArgs, PausedEvent,
    BODY_FETCH_DEADLINE,
};
use crate::executor::{ExecutionOutcome, Executor, ExecutorOptions};

/// Deadline for the best-effort continue taken on degradation paths, so
/// the browser is never left holding a pause.
const DEGRADE_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
pub struct HandlerConfig {
    pub process_timeout: Duration,
    pub body_size_threshold: u64,
}

pub struct Handler {
    session: SessionId,
    engine: Arc<Engine>,
    approvals: Arc<ApprovalCoordinator>,
    events_tx: mpsc::Sender<NetworkEvent>,
    events_dropped: AtomicU64,
    cfg: HandlerConfig,
}

impl Handler {
    pub fn new(
        session: SessionId,
        engine: Arc<Engine>,
        approvals: Arc<ApprovalCoordinator>,
        events_tx: mpsc::Sender<NetworkEvent>,
        cfg: HandlerConfig,
    ) -> Self {
        Self {
            session,
            engine,
            approvals,
            events_tx,
            events_dropped: AtomicU64::new(0),
            cfg,
        }
    }

    /// Events the consumer was too slow to take.
    pub fn dropped_events(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Process one paused event to a terminal protocol call.
    pub async fn handle(
        &self,
        client: Arc<CdpClient>,
        cancel: CancellationToken,
        target: TargetId,
        ev: PausedEvent,
    ) {
        let started = Instant::now();
        let stage = ev.stage();
        let url = ev.request.url.clone();
        let method = ev.request.method.clone();
        debug!(target: "wiretap::handler", stage = %stage, url = %url, method = %method,
               "paused event entered");

        self.emit(NetworkEvent::Intercepted {
            target: target.clone(),
            url: url.clone(),
            method: method.clone(),
            stage,
            timestamp: now_ms(),
        });

        let mut exec = Executor::new(
            ev,
            ExecutorOptions {
                body_size_threshold: self.cfg.body_size_threshold,
            },
        );

        // Long connections are continued untouched before any body work.
        if stage == Stage::Response && exec.is_long_connection() {
            self.continue_plain(&client, exec.event(), stage).await;
            self.emit(self.unmatched_event(&target, exec.event(), stage));
            return;
        }

        let original_body = if exec.should_fetch_body() {
            match client
                .get_response_body(&exec.event().request_id, BODY_FETCH_DEADLINE)
                .await
            {
                Ok(body) => Some(body),
                Err(err) => {
                    warn!(target: "wiretap::handler", error = %err, url = %url,
                          "response body fetch failed");
                    self.emit(NetworkEvent::Error {
                        target: target.clone(),
                        url: Some(url.clone()),
                        message: err.to_string(),
                        timestamp: now_ms(),
                    });
                    None
                }
            }
        } else {
            None
        };

        let ctx = build_context(exec.event(), stage, original_body.clone());
        let matched = self.engine.evaluate(&ctx);
        if matched.is_empty() {
            self.continue_plain(&client, exec.event(), stage).await;
            self.emit(self.unmatched_event(&target, exec.event(), stage));
            return;
        }

        // Probabilistic degradation declared by the rules themselves.
        if let Some(rate) = first_drop_rate(&matched) {
            if rand::random::<f64>() < rate {
                self.degrade(&client, exec.event(), &target, "drop rate").await;
                return;
            }
        }

        if let Some(delay) = first_delay(&matched) {
            let remaining = self.cfg.process_timeout.saturating_sub(started.elapsed());
            let nap = Duration::from_millis(delay).min(remaining);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.degrade(&client, exec.event(), &target, "cancelled").await;
                    return;
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }

        if started.elapsed() >= self.cfg.process_timeout {
            self.degrade(&client, exec.event(), &target, "deadline exceeded").await;
            return;
        }

        let result = match stage {
            Stage::Request => exec.execute_request(&matched),
            Stage::Response => exec.execute_response(&matched, original_body),
        };

        match result.outcome {
            ExecutionOutcome::Pause {
                timeout_ms,
                default,
                rule,
            } => {
                self.run_approval(
                    &client, &cancel, &target, &mut exec, stage, timeout_ms, default, rule,
                )
                .await;
            }
            outcome => {
                let intended = match &outcome {
                    ExecutionOutcome::Fulfill(_) if exec.has_synthetic_terminal() => {
                        FinalResult::Blocked
                    }
                    ExecutionOutcome::Fulfill(_) => FinalResult::Modified,
                    ExecutionOutcome::Fail(_) => FinalResult::Failed,
                    _ if result.modified => FinalResult::Modified,
                    _ => FinalResult::Passed,
                };
                let request_id = exec.event().request_id.clone();
                let final_result = self
                    .apply_outcome(&client, &request_id, &outcome, intended)
                    .await;
                self.emit(self.matched_event(&target, &exec, stage, final_result));
            }
        }
        debug!(target: "wiretap::handler", stage = %stage, url = %url,
               elapsed_ms = started.elapsed().as_millis() as u64, "paused event resolved");
    }

    /// Forced continue on a resource-budget failure. Public so the
    /// interceptor can take this path on pool overflow without entering
    /// the handler proper.
    pub async fn degrade(
        &self,
        client: &CdpClient,
        ev: &PausedEvent,
        target: &TargetId,
        reason: &str,
    ) {
        warn!(target: "wiretap::handler", reason, request_id = %ev.request_id,
              "degrading to plain continue");
        self.continue_plain(client, ev, ev.stage()).await;
        self.emit(NetworkEvent::Degraded {
            target: target.clone(),
            url: Some(ev.request.url.clone()),
            reason: reason.to_string(),
            timestamp: now_ms(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_approval(
        &self,
        client: &Arc<CdpClient>,
        cancel: &CancellationToken,
        target: &TargetId,
        exec: &mut Executor,
        stage: Stage,
        timeout_ms: u64,
        default: PauseDefault,
        rule: RuleId,
    ) {
        let id = exec.event().request_id.clone();
        let rx = self.approvals.register(&id);

        let item = PendingItem {
            id: id.clone(),
            stage,
            url: exec.event().request.url.clone(),
            method: exec.event().request.method.clone(),
            target: target.clone(),
            rule: Some(rule),
            created_at: now_ms(),
        };

        // A full pending queue never blocks the worker: take the default.
        if !self.approvals.offer(item) {
            self.approvals.unregister(&id);
            let final_result = self.apply_pause_default(client, exec, stage, &default).await;
            self.emit(self.matched_event(target, exec, stage, final_result));
            return;
        }

        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                self.approvals.unregister(&id);
                self.degrade(client, exec.event(), target, "cancelled").await;
                return;
            }
            decision = self.approvals.wait(rx, timeout_ms) => decision,
        };
        self.approvals.unregister(&id);

        let final_result = match decision {
            Some(Decision::Approve(rewrite)) => {
                if !rewrite.is_noop() {
                    match stage {
                        Stage::Request => exec.fold_rewrite(&rewrite),
                        Stage::Response => exec.fold_response_rewrite(&rewrite),
                    }
                }
                self.apply_accumulated(client, exec, stage).await
            }
            Some(Decision::Reject) => {
                self.apply_outcome(
                    client,
                    &id,
                    &ExecutionOutcome::Fail(ErrorReason::Aborted),
                    FinalResult::Failed,
                )
                .await
            }
            None => self.apply_pause_default(client, exec, stage, &default).await,
        };
        self.emit(self.matched_event(target, exec, stage, final_result));
    }

    async fn apply_pause_default(
        &self,
        client: &Arc<CdpClient>,
        exec: &Executor,
        stage: Stage,
        default: &PauseDefault,
    ) -> FinalResult {
        let request_id = exec.event().request_id.clone();
        match default {
            PauseDefault::Fulfill { status } => {
                let args = FulfillRequestArgs {
                    request_id: request_id.clone(),
                    response_code: *status,
                    response_headers: None,
                    body: None,
                };
                self.apply_outcome(
                    client,
                    &request_id,
                    &ExecutionOutcome::Fulfill(args),
                    FinalResult::Blocked,
                )
                .await
            }
            PauseDefault::Fail { reason } => {
                self.apply_outcome(
                    client,
                    &request_id,
                    &ExecutionOutcome::Fail(*reason),
                    FinalResult::Failed,
                )
                .await
            }
            PauseDefault::ContinueMutated => self.apply_accumulated(client, exec, stage).await,
        }
    }

    /// Continue with whatever mutation the executor accumulated so far.
    async fn apply_accumulated(
        &self,
        client: &Arc<CdpClient>,
        exec: &Executor,
        stage: Stage,
    ) -> FinalResult {
        let outcome = match stage {
            Stage::Request => ExecutionOutcome::ContinueRequest(exec.finalize_request()),
            Stage::Response => exec.finalize_response_outcome(),
        };
        let intended = match &outcome {
            ExecutionOutcome::ContinueRequest(args) if args.is_passthrough() => FinalResult::Passed,
            ExecutionOutcome::ContinueResponse(args) if args.response_code.is_none() => {
                FinalResult::Passed
            }
            _ => FinalResult::Modified,
        };
        self.apply_outcome(client, &exec.event().request_id, &outcome, intended)
            .await
    }

    /// Issue the terminal protocol call for an outcome. Failures are
    /// absorbed: the result degrades to an `error` disposition.
    async fn apply_outcome(
        &self,
        client: &CdpClient,
        request_id: &str,
        outcome: &ExecutionOutcome,
        intended: FinalResult,
    ) -> FinalResult {
        let call = async {
            match outcome {
                ExecutionOutcome::ContinueRequest(args) => client.continue_request(args).await,
                ExecutionOutcome::ContinueResponse(args) => client.continue_response(args).await,
                ExecutionOutcome::Fulfill(args) => client.fulfill_request(args).await,
                ExecutionOutcome::Fail(reason) => client.fail_request(request_id, *reason).await,
                ExecutionOutcome::Pause { .. } => Ok(()),
            }
        };

        match tokio::time::timeout(self.cfg.process_timeout, call).await {
            Ok(Ok(())) => intended,
            Ok(Err(err)) => {
                warn!(target: "wiretap::handler", error = %err, "terminal call failed");
                FinalResult::Error
            }
            Err(_) => {
                warn!(target: "wiretap::handler", "terminal call timed out");
                FinalResult::Error
            }
        }
    }

    async fn continue_plain(&self, client: &CdpClient, ev: &PausedEvent, stage: Stage) {
        let result = match stage {
            Stage::Request => {
                let args = ContinueRequestArgs::passthrough(&ev.request_id);
                tokio::time::timeout(DEGRADE_DEADLINE, client.continue_request(&args)).await
            }
            Stage::Response => {
                let args = ContinueResponseArgs::passthrough(&ev.request_id);
                tokio::time::timeout(DEGRADE_DEADLINE, client.continue_response(&args)).await
            }
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target: "wiretap::handler", error = %err, "plain continue failed")
            }
            Err(_) => warn!(target: "wiretap::handler", "plain continue timed out"),
        }
    }

    fn unmatched_event(&self, target: &TargetId, ev: &PausedEvent, stage: Stage) -> NetworkEvent {
        NetworkEvent::Unmatched {
            target: target.clone(),
            url: ev.request.url.clone(),
            method: ev.request.method.clone(),
            stage,
            status_code: ev.response_status_code,
            timestamp: now_ms(),
        }
    }

    fn matched_event(
        &self,
        target: &TargetId,
        exec: &Executor,
        stage: Stage,
        final_result: FinalResult,
    ) -> NetworkEvent {
        let (original, modified) = match stage {
            Stage::Request => (
                exec.original_request_snapshot(),
                exec.final_request_snapshot(),
            ),
            Stage::Response => (
                exec.original_response_snapshot(),
                exec.final_response_snapshot(),
            ),
        };
        NetworkEvent::Matched(Box::new(MatchedEvent {
            session: self.session.clone(),
            target: target.clone(),
            url: exec.event().request.url.clone(),
            method: exec.event().request.method.clone(),
            stage,
            status_code: exec.event().response_status_code,
            timestamp: now_ms(),
            final_result,
            matched_rules: exec.executed_rules(),
            original,
            modified,
        }))
    }

    /// Non-blocking, best-effort emission. A slow consumer loses events,
    /// never the terminal call.
    fn emit(&self, event: NetworkEvent) {
        if self.events_tx.try_send(event).is_err() {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(target: "wiretap::handler", "event channel full, dropped");
        }
    }
}

fn first_drop_rate(matched: &[MatchedRule]) -> Option<f64> {
    matched.iter().find_map(|mr| {
        mr.rule.actions.iter().find_map(|a| match a {
            Action::Drop { rate } if *rate > 0.0 => Some(*rate),
            _ => None,
        })
    })
}

fn first_delay(matched: &[MatchedRule]) -> Option<u64> {
    matched.iter().find_map(|mr| {
        mr.rule.actions.iter().find_map(|a| match a {
            Action::Delay { delay_ms } if *delay_ms > 0 => Some(*delay_ms),
            _ => None,
        })
    })
}

/// Build the evaluation context for one paused event: keys are normalized
/// at construction, values stay verbatim.
pub fn build_context(ev: &PausedEvent, stage: Stage, response_body: Option<String>) -> EvalContext {
    match stage {
        Stage::Request => EvalContext::new(
            stage,
            ContextSeed {
                url: ev.request.url.clone(),
                method: ev.request.method.clone(),
                resource_type: ev.resource_type.clone(),
                headers: ev.request.headers.clone(),
                cookies: HashMap::new(),
                body: ev.post_data().to_string(),
            },
        ),
        Stage::Response => {
            let mut headers = HashMap::with_capacity(ev.response_headers.len());
            let mut cookies = HashMap::new();
            for entry in &ev.response_headers {
                if entry.name.eq_ignore_ascii_case("set-cookie") {
                    if let Some((name, value)) = parse_set_cookie(&entry.value) {
                        cookies.insert(name, value);
                    }
                }
                headers.insert(entry.name.clone(), entry.value.clone());
            }
            EvalContext::new(
                stage,
                ContextSeed {
                    url: ev.request.url.clone(),
                    method: ev.request.method.clone(),
                    resource_type: ev.resource_type.clone(),
                    headers,
                    cookies,
                    body: response_body.unwrap_or_default(),
                },
            )
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_context_carries_set_cookie_and_body() {
        let ev: PausedEvent = serde_json::from_value(json!({
            "requestId": "r",
            "request": { "url": "https://x/?a=1", "method": "GET", "headers": {} },
            "frameId": "f",
            "resourceType": "XHR",
            "responseStatusCode": 200,
            "responseHeaders": [
                {"name": "Set-Cookie", "value": "sid=xyz; HttpOnly"},
                {"name": "Content-Type", "value": "application/json"}
            ]
        }))
        .unwrap();

        let ctx = build_context(&ev, Stage::Response, Some("{\"ok\":true}".into()));
        assert_eq!(ctx.cookie("sid"), Some("xyz"));
        assert_eq!(ctx.content_type(), "application/json");
        assert_eq!(ctx.body(), "{\"ok\":true}");
        assert_eq!(ctx.query_param("a"), Some("1"));
    }
}
