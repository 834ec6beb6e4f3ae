//! Single-worker reconcile queue: deduplicates keys, requeues after conflicts
//! and backs off on errors.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;

use keel_core::ReconcileKey;
use keel_reconcile::{Outcome, ReconcileError};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// FIFO of pending keys; a key already waiting is not queued twice.
#[derive(Debug, Default)]
pub struct DedupQueue {
    order: VecDeque<ReconcileKey>,
    pending: HashSet<ReconcileKey>,
}

impl DedupQueue {
    pub fn push(&mut self, key: ReconcileKey) -> bool {
        if !self.pending.insert(key.clone()) { return false; }
        self.order.push_back(key);
        true
    }

    pub fn pop(&mut self) -> Option<ReconcileKey> {
        let key = self.order.pop_front()?;
        self.pending.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize { self.order.len() }

    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

/// Exponential backoff for the n-th consecutive failure (n >= 1).
pub fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1u32 << exp).min(BACKOFF_MAX)
}

pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<ReconcileKey>,
    tx: mpsc::UnboundedSender<ReconcileKey>,
    requeue_after: Duration,
    queue: DedupQueue,
    failures: HashMap<ReconcileKey, u32>,
}

impl Dispatcher {
    /// `tx` must feed `rx`; delayed retries are sent through it.
    pub fn new(rx: mpsc::UnboundedReceiver<ReconcileKey>, tx: mpsc::UnboundedSender<ReconcileKey>, requeue_after: Duration) -> Self {
        Self { rx, tx, requeue_after, queue: DedupQueue::default(), failures: HashMap::new() }
    }

    fn later(&self, key: ReconcileKey, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(key);
        });
    }

    /// Run until every sender is gone. One reconcile at a time.
    pub async fn run<F, Fut>(mut self, mut reconcile: F)
    where
        F: FnMut(ReconcileKey) -> Fut,
        Fut: Future<Output = Result<Outcome, ReconcileError>>,
    {
        loop {
            while let Ok(k) = self.rx.try_recv() {
                self.queue.push(k);
            }
            let Some(key) = self.queue.pop() else {
                match self.rx.recv().await {
                    Some(k) => {
                        self.queue.push(k);
                        continue;
                    }
                    None => break,
                }
            };

            match reconcile(key.clone()).await {
                Ok(Outcome::Done) => {
                    self.failures.remove(&key);
                    debug!(%key, "reconciled");
                }
                Ok(Outcome::Requeue) => {
                    info!(%key, after = ?self.requeue_after, "requeue");
                    self.later(key, self.requeue_after);
                }
                Err(e) => {
                    let n = self.failures.entry(key.clone()).or_insert(0);
                    *n += 1;
                    let delay = backoff(*n);
                    error!(%key, failures = *n, retry_in = ?delay, error = %e, "reconcile failed");
                    self.later(key, delay);
                }
            }
        }
        info!("dispatcher stopped");
    }
}
