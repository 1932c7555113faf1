//! Approval Coordinator
//!
//! Holds paused events for human decisions. A waiter registers a one-shot
//! slot keyed by the paused request id and parks on it with a deadline;
//! the approval API deposits a decision into the slot. The waiter map is
//! only ever locked for map mutation, never across a wait, and stale
//! deposits (waiter already gone) are silently dropped.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use wiretap_common::PendingItem;
use wiretap_rules::Rewrite;

/// User verdict for one held exchange.
#[derive(Clone, Debug)]
pub enum Decision {
    Approve(Rewrite),
    Reject,
}

pub struct ApprovalCoordinator {
    waiters: DashMap<String, oneshot::Sender<Decision>>,
    pending_tx: mpsc::Sender<PendingItem>,
}

impl ApprovalCoordinator {
    /// Returns the coordinator plus the receiver end of the process-wide
    /// pending queue (consumed by the approval UI).
    pub fn new(pending_capacity: usize) -> (Self, mpsc::Receiver<PendingItem>) {
        let (pending_tx, pending_rx) = mpsc::channel(pending_capacity.max(1));
        (
            Self {
                waiters: DashMap::new(),
                pending_tx,
            },
            pending_rx,
        )
    }

    /// Create the decision slot for a paused id. The returned receiver is
    /// handed to [`ApprovalCoordinator::wait`].
    pub fn register(&self, id: &str) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.to_string(), tx);
        rx
    }

    /// Drop the slot. Safe to call on any exit path; unknown ids no-op.
    pub fn unregister(&self, id: &str) {
        self.waiters.remove(id);
    }

    /// Publish the pending item to the approval queue. Returns `false`
    /// when the queue is full — the caller must apply the pause default
    /// immediately rather than wait.
    pub fn offer(&self, item: PendingItem) -> bool {
        match self.pending_tx.try_send(item) {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "wiretap::approval", error = %err, "pending queue full");
                false
            }
        }
    }

    /// Park until a decision arrives or the rule's timeout elapses.
    /// `None` means timeout.
    pub async fn wait(
        &self,
        rx: oneshot::Receiver<Decision>,
        timeout_ms: u64,
    ) -> Option<Decision> {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }

    /// Deposit an approval. Stale ids (timed out, already resolved) are
    /// dropped silently.
    pub fn approve(&self, id: &str, rewrite: Rewrite) -> bool {
        self.resume(id, Decision::Approve(rewrite))
    }

    /// Deposit a rejection; the held exchange is failed.
    pub fn reject(&self, id: &str) -> bool {
        self.resume(id, Decision::Reject)
    }

    fn resume(&self, id: &str, decision: Decision) -> bool {
        match self.waiters.remove(id) {
            Some((_, tx)) => {
                debug!(target: "wiretap::approval", id, "resuming held exchange");
                tx.send(decision).is_ok()
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }
}
