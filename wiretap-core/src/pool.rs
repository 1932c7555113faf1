//! Bounded Worker Pool
//!
//! Fixed number of worker tasks draining a bounded queue. Submission is
//! strictly non-blocking: a full queue rejects the task immediately so the
//! paused-event consumer can take its degradation path instead of stalling
//! the stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use wiretap_common::PoolStats;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    concurrency: usize,
    capacity: usize,
    queue_tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    queue_len: Arc<AtomicI64>,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl WorkerPool {
    pub fn new(concurrency: usize, capacity: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            capacity: capacity.max(1),
            queue_tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            queue_len: Arc::new(AtomicI64::new(0)),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Spawn the worker tasks. Idempotent; called lazily when
    /// interception is enabled.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::channel::<Job>(self.capacity);
        *self.queue_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in 0..self.concurrency {
            let rx = shared_rx.clone();
            let queue_len = self.queue_len.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // The receiver lock is held only across the dequeue,
                    // never across job execution.
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => {
                            queue_len.fetch_sub(1, Ordering::Relaxed);
                            job.await;
                        }
                        None => break,
                    }
                }
                debug!(target: "wiretap::pool", worker, "worker drained");
            }));
        }
        info!(target: "wiretap::pool",
              workers = self.concurrency, capacity = self.capacity, "worker pool started");
    }

    /// Offer a task to the pool. Returns `false` immediately when the
    /// queue is full or the pool is stopped; never blocks.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match tx.try_send(Box::pin(task)) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                self.queue_len.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_len: self.queue_len.load(Ordering::Relaxed).max(0) as u64,
            capacity: self.capacity as u64,
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn stop(&self) {
        {
            let mut guard = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
        self.started.store(false, Ordering::SeqCst);
        info!(target: "wiretap::pool", "worker pool stopped");
    }
}
