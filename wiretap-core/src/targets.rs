//! Target Manager
//!
//! Discovers browser targets, owns per-target protocol sessions, and in
//! auto-follow mode tracks the page the user is actually looking at: a 2 s
//! workspace poll diffs the candidate set, and a lightweight lifecycle
//! watcher per candidate reports `visible` transitions. Candidate switches
//! and recoveries surface on a channel; the session service performs the
//! actual attach-and-enable so interception wiring stays in one place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wiretap_common::{TargetId, TargetInfo};

use crate::cdp::{
    discovery::{is_user_page, is_user_page_url, select_auto_target},
    CdpClient, Discovery, TargetDescription,
};
use crate::error::{CoreError, CoreResult};

const WORKSPACE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CANDIDATE_CHANNEL_CAPACITY: usize = 16;

/// One attached target: protocol client plus its cancellation scope.
pub struct TargetSession {
    pub id: TargetId,
    pub client: Arc<CdpClient>,
    pub cancel: CancellationToken,
    pub attached_at: i64,
}

#[derive(Clone, Debug, PartialEq)]
enum FollowMode {
    /// Follow the visible user page.
    Auto,
    /// Pinned to one target id.
    Fixed(TargetId),
}

struct ManagerState {
    mode: FollowMode,
    current: Option<TargetId>,
    sessions: HashMap<TargetId, Arc<TargetSession>>,
}

struct Watcher {
    cancel: CancellationToken,
}

pub struct TargetManager {
    discovery: Discovery,
    root: CancellationToken,
    state: Mutex<ManagerState>,
    watchers: std::sync::Mutex<HashMap<TargetId, Watcher>>,
    watch_loop: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    candidates_tx: mpsc::Sender<TargetId>,
}

impl TargetManager {
    /// Returns the manager and the candidate channel: target ids that
    /// auto-follow wants attached (from polling or visibility events).
    pub fn new(
        devtools_url: &str,
        root: CancellationToken,
    ) -> CoreResult<(Arc<Self>, mpsc::Receiver<TargetId>)> {
        let (candidates_tx, candidates_rx) = mpsc::channel(CANDIDATE_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            discovery: Discovery::new(devtools_url)?,
            root,
            state: Mutex::new(ManagerState {
                mode: FollowMode::Auto,
                current: None,
                sessions: HashMap::new(),
            }),
            watchers: std::sync::Mutex::new(HashMap::new()),
            watch_loop: std::sync::Mutex::new(None),
            candidates_tx,
        });
        Ok((manager, candidates_rx))
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Attach to a specific target (fixed mode) or to the auto-selected
    /// user page (auto-follow mode).
    pub async fn attach(self: &Arc<Self>, target: Option<TargetId>) -> CoreResult<Arc<TargetSession>> {
        let mode = match &target {
            Some(id) => FollowMode::Fixed(id.clone()),
            None => FollowMode::Auto,
        };
        let session = self.attach_inner(target, Some(mode.clone())).await?;
        match mode {
            FollowMode::Auto => self.start_watch_loop(),
            FollowMode::Fixed(_) => self.stop_watch_loop(),
        }
        Ok(session)
    }

    /// Attach a candidate reported on the channel. Only meaningful in
    /// auto-follow mode; the previously followed session is detached.
    pub async fn attach_candidate(
        self: &Arc<Self>,
        id: TargetId,
    ) -> CoreResult<Option<Arc<TargetSession>>> {
        {
            let state = self.state.lock().await;
            if state.mode != FollowMode::Auto {
                return Ok(None);
            }
            if state.current.as_ref() == Some(&id) {
                return Ok(None);
            }
        }
        self.attach_inner(Some(id), None).await.map(Some)
    }

    /// Single-shot re-attach after a stream failure, preserving mode.
    pub async fn recover(self: &Arc<Self>, failed: &TargetId) -> CoreResult<Arc<TargetSession>> {
        self.detach(failed).await;
        let want = {
            let state = self.state.lock().await;
            match &state.mode {
                FollowMode::Fixed(id) => Some(id.clone()),
                FollowMode::Auto => None,
            }
        };
        info!(target: "wiretap::targets", failed = %failed, "re-attaching after stream failure");
        self.attach_inner(want, None).await
    }

    async fn attach_inner(
        &self,
        want: Option<TargetId>,
        set_mode: Option<FollowMode>,
    ) -> CoreResult<Arc<TargetSession>> {
        let targets = self.discovery.list_targets().await?;
        let selected = match &want {
            Some(id) => targets.iter().find(|t| t.id == id.0),
            None => select_auto_target(&targets),
        };
        let Some(selected) = selected else {
            warn!(target: "wiretap::targets", "no attachable target");
            return Err(CoreError::NoTarget);
        };
        let ws_url = selected
            .web_socket_debugger_url
            .clone()
            .ok_or_else(|| CoreError::AttachFailed(format!("target {} has no debugger URL", selected.id)))?;
        let id = TargetId(selected.id.clone());

        let mut state = self.state.lock().await;
        if let Some(mode) = set_mode {
            state.mode = mode;
        }

        if let Some(existing) = state.sessions.get(&id) {
            if existing.client.is_alive() {
                let existing = existing.clone();
                state.current = Some(id.clone());
                return Ok(existing);
            }
        }

        let client = CdpClient::connect(&ws_url)
            .await
            .map_err(|err| CoreError::AttachFailed(err.to_string()))?;
        let session = Arc::new(TargetSession {
            id: id.clone(),
            client: Arc::new(client),
            cancel: self.root.child_token(),
            attached_at: chrono::Utc::now().timestamp_millis(),
        });

        // Auto-follow keeps one followed session at a time.
        let previous = state.current.clone();
        state.sessions.insert(id.clone(), session.clone());
        state.current = Some(id.clone());
        let drop_previous = match (&state.mode, &previous) {
            (FollowMode::Auto, Some(prev)) if prev != &id => state.sessions.remove(prev),
            _ => None,
        };
        drop(state);

        if let Some(prev) = drop_previous {
            prev.cancel.cancel();
            prev.client.close();
            debug!(target: "wiretap::targets", target_id = %prev.id, "detached previous followed target");
        }

        info!(target: "wiretap::targets", target_id = %id, "attached");
        Ok(session)
    }

    /// Detach one target: cancel its scope, close its socket, unregister.
    pub async fn detach(&self, id: &TargetId) {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.sessions.remove(id);
            if state.current.as_ref() == Some(id) {
                state.current = None;
            }
            removed
        };
        if let Some(session) = removed {
            session.cancel.cancel();
            session.client.close();
            info!(target: "wiretap::targets", target_id = %id, "detached");
        }
    }

    /// Tear down every session and the watcher machinery.
    pub async fn detach_all(&self) {
        self.stop_watch_loop();
        let sessions: Vec<Arc<TargetSession>> = {
            let mut state = self.state.lock().await;
            state.current = None;
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.cancel.cancel();
            session.client.close();
        }
    }

    pub async fn sessions(&self) -> Vec<Arc<TargetSession>> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    pub async fn current(&self) -> Option<Arc<TargetSession>> {
        let state = self.state.lock().await;
        state
            .current
            .as_ref()
            .and_then(|id| state.sessions.get(id))
            .cloned()
    }

    pub async fn list_targets(&self) -> CoreResult<Vec<TargetInfo>> {
        let targets = self.discovery.list_targets().await?;
        let current = self.state.lock().await.current.clone();
        Ok(targets
            .into_iter()
            .map(|t| {
                let id = TargetId(t.id);
                TargetInfo {
                    is_current: current.as_ref() == Some(&id),
                    is_user_page: t.kind == "page" && is_user_page_url(&t.url),
                    id,
                    kind: t.kind,
                    url: t.url,
                    title: t.title,
                }
            })
            .collect())
    }

    // ---- workspace watching --------------------------------------------

    fn start_watch_loop(self: &Arc<Self>) {
        let mut guard = self.watch_loop.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let cancel = self.root.child_token();
        let manager = self.clone();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            manager.watch_workspace(loop_cancel).await;
        });
        *guard = Some((cancel, task));
        debug!(target: "wiretap::targets", "workspace watcher started");
    }

    fn stop_watch_loop(&self) {
        let taken = {
            let mut guard = self.watch_loop.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some((cancel, task)) = taken {
            cancel.cancel();
            task.abort();
        }
        self.stop_all_watchers();
    }

    async fn watch_workspace(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(WORKSPACE_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.check_workspace().await;
        }
        self.stop_all_watchers();
    }

    async fn check_workspace(self: &Arc<Self>) {
        let targets = match self.discovery.list_targets().await {
            Ok(targets) => targets,
            Err(err) => {
                debug!(target: "wiretap::targets", error = %err, "workspace poll failed");
                return;
            }
        };
        self.refresh_watchers(&targets);

        let Some(selected) = select_auto_target(&targets) else {
            return;
        };
        let candidate = TargetId(selected.id.clone());
        let current = self.state.lock().await.current.clone();
        if current.as_ref() != Some(&candidate) {
            let _ = self.candidates_tx.try_send(candidate);
        }
    }

    /// Diff the watcher registry against the live candidate set: close
    /// watchers for gone targets, open one per new user page.
    fn refresh_watchers(self: &Arc<Self>, targets: &[TargetDescription]) {
        let live: HashMap<TargetId, &TargetDescription> = targets
            .iter()
            .filter(|t| is_user_page(t))
            .map(|t| (TargetId(t.id.clone()), t))
            .collect();
        let live_ids: HashSet<&TargetId> = live.keys().collect();

        let mut to_spawn: Vec<(TargetId, String)> = Vec::new();
        {
            let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
            watchers.retain(|id, watcher| {
                let keep = live_ids.contains(id);
                if !keep {
                    watcher.cancel.cancel();
                }
                keep
            });
            for (id, desc) in &live {
                if watchers.contains_key(id) {
                    continue;
                }
                let Some(ws_url) = desc.web_socket_debugger_url.clone() else {
                    continue;
                };
                let cancel = self.root.child_token();
                watchers.insert(id.clone(), Watcher { cancel: cancel.clone() });
                to_spawn.push((id.clone(), ws_url));
            }
        }

        for (id, ws_url) in to_spawn {
            let cancel = {
                let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
                match watchers.get(&id) {
                    Some(watcher) => watcher.cancel.clone(),
                    None => continue,
                }
            };
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_watcher(id, ws_url, cancel).await;
            });
        }
    }

    /// Lifecycle subscription for one candidate target. A `visible` event
    /// on a non-current target makes it the follow candidate.
    async fn run_watcher(self: Arc<Self>, id: TargetId, ws_url: String, cancel: CancellationToken) {
        let client = match CdpClient::connect(&ws_url).await {
            Ok(client) => client,
            Err(err) => {
                debug!(target: "wiretap::targets", target_id = %id, error = %err,
                       "watcher connect failed");
                self.remove_watcher(&id);
                return;
            }
        };
        if let Err(err) = client.enable_page_lifecycle().await {
            debug!(target: "wiretap::targets", target_id = %id, error = %err,
                   "watcher subscription failed");
            client.close();
            self.remove_watcher(&id);
            return;
        }

        while let Some(event) = client.next_lifecycle(&cancel).await {
            if event.name != "visible" {
                continue;
            }
            let (auto, is_current) = {
                let state = self.state.lock().await;
                (
                    state.mode == FollowMode::Auto,
                    state.current.as_ref() == Some(&id),
                )
            };
            if auto && !is_current {
                debug!(target: "wiretap::targets", target_id = %id, "target became visible");
                let _ = self.candidates_tx.try_send(id.clone());
            }
        }
        client.close();
        self.remove_watcher(&id);
    }

    fn remove_watcher(&self, id: &TargetId) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(watcher) = watchers.remove(id) {
            watcher.cancel.cancel();
        }
    }

    fn stop_all_watchers(&self) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, watcher) in watchers.drain() {
            watcher.cancel.cancel();
        }
    }
}
