//! Expiration scheduler
//!
//! Distributions wait in an in-memory min-heap ordered by creation time. Each
//! tick pops every entry older than the expiry window and hands it to a worker
//! on a bounded pool; the tick itself never waits for the workers.
//!
//! The persisted checkpoint records the highest id below which every
//! distribution is known to be expired, so a restart only rehydrates ids above
//! it. A companion task advances it once a tick's workers finish, clamped
//! below anything still queued or in flight; failed entries go back on the
//! heap and are retried on a later tick.

use crate::{
    config::SchedulerConfig,
    engine::DistributionEngine,
    notify::{Notice, Pusher},
    types::DistributionId,
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Heap entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiryEntry {
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Distribution id
    pub id: DistributionId,
}

/// Min-heap of distributions awaiting expiry, shared between engine and scheduler
#[derive(Debug, Clone, Default)]
pub struct ExpiryQueue {
    heap: Arc<Mutex<BinaryHeap<Reverse<ExpiryEntry>>>>,
}

impl ExpiryQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a distribution
    pub fn push(&self, created_at: DateTime<Utc>, id: DistributionId) {
        self.heap.lock().push(Reverse(ExpiryEntry { created_at, id }));
    }

    /// Remove and return every entry with `now - created_at >= window`, oldest first
    pub fn pop_due(&self, now: DateTime<Utc>, window: chrono::Duration) -> Vec<ExpiryEntry> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = heap.peek() {
            if now - entry.created_at < window {
                break;
            }
            due.push(*entry);
            heap.pop();
        }
        due
    }

    /// Oldest entry
    pub fn peek(&self) -> Option<ExpiryEntry> {
        self.heap.lock().peek().map(|Reverse(entry)| *entry)
    }

    /// Smallest queued id
    pub fn min_id(&self) -> Option<DistributionId> {
        self.heap.lock().iter().map(|Reverse(entry)| entry.id).min()
    }

    /// Queued entries
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

/// Background expiry of unclaimed distributions
#[derive(Debug)]
pub struct ExpirationScheduler {
    engine: Arc<DistributionEngine>,
    pusher: Option<Pusher>,
    config: SchedulerConfig,
    expire_after: chrono::Duration,
    workers: Arc<Semaphore>,
    inflight: Arc<Mutex<BTreeSet<DistributionId>>>,
}

impl ExpirationScheduler {
    /// Create scheduler; refund notices go to `pusher` when present
    pub fn new(
        engine: Arc<DistributionEngine>,
        config: SchedulerConfig,
        expire_after: chrono::Duration,
        pusher: Option<Pusher>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            engine,
            pusher,
            config,
            expire_after,
            workers,
            inflight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Re-queue every unexpired distribution above the checkpoint
    pub fn rehydrate(&self) -> Result<usize> {
        let checkpoint = self.engine.checkpoint()?;
        let queue = self.engine.queue().clone();
        let mut count = 0usize;
        self.engine.for_each_from(checkpoint + 1, |distribution| {
            if !distribution.expired {
                queue.push(distribution.created_at, distribution.id);
                count += 1;
            }
            true
        })?;
        info!(checkpoint, requeued = count, "Expiry queue rehydrated");
        Ok(count)
    }

    /// Dispatch every due entry to the worker pool.
    ///
    /// Returns the companion task that advances the checkpoint once the
    /// workers finish, or `None` when nothing was due.
    pub fn tick(&self, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        let due = self.engine.queue().pop_due(now, self.expire_after);
        if due.is_empty() {
            return None;
        }
        debug!(due = due.len(), "Expiry tick");

        {
            let mut inflight = self.inflight.lock();
            inflight.extend(due.iter().map(|entry| entry.id));
        }

        let mut handles = Vec::with_capacity(due.len());
        for entry in due {
            let engine = Arc::clone(&self.engine);
            let workers = Arc::clone(&self.workers);
            let pusher = self.pusher.clone();
            let handle = tokio::spawn(async move {
                let _permit = workers.acquire_owned().await.map_err(|_| Error::Cancelled)?;
                let expired = tokio::task::spawn_blocking(move || engine.expire(entry.id))
                    .await
                    .map_err(|e| Error::Other(format!("expiry worker failed: {}", e)))??;
                if let (Some(refund), Some(pusher)) = (expired, pusher) {
                    if refund.amount > Decimal::ZERO {
                        pusher.push(
                            refund.sender,
                            Notice::DistributionRefunded {
                                distribution_id: refund.distribution_id,
                                asset: refund.asset,
                                amount: refund.amount,
                            },
                        );
                    }
                }
                Ok::<_, Error>(())
            });
            handles.push((entry, handle));
        }

        let engine = Arc::clone(&self.engine);
        let inflight = Arc::clone(&self.inflight);
        Some(tokio::spawn(async move {
            finish_tick(engine, inflight, handles).await;
        }))
    }

    /// Tick every `tick_interval_ms` until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.tick_interval_ms,
            workers = self.config.worker_pool_size,
            "Starting expiration scheduler"
        );
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self.tick(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Expiration scheduler stopped");
    }
}

async fn finish_tick(
    engine: Arc<DistributionEngine>,
    inflight: Arc<Mutex<BTreeSet<DistributionId>>>,
    handles: Vec<(ExpiryEntry, JoinHandle<Result<()>>)>,
) {
    let mut highest_done: Option<DistributionId> = None;
    let mut finished = Vec::with_capacity(handles.len());
    let mut failed = Vec::new();

    for (entry, handle) in handles {
        finished.push(entry.id);
        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("expiry task failed: {}", e))),
        };
        match outcome {
            Ok(()) => highest_done = highest_done.max(Some(entry.id)),
            Err(e) => {
                warn!(distribution_id = entry.id, error = %e, "Expiry failed, re-queued");
                failed.push(entry);
            }
        }
    }

    // Failures go back on the heap before the bound is taken, so the
    // checkpoint can never pass them.
    let queue = engine.queue();
    let bound = {
        let mut inflight = inflight.lock();
        for id in &finished {
            inflight.remove(id);
        }
        for entry in &failed {
            queue.push(entry.created_at, entry.id);
        }
        let oldest_inflight = inflight.iter().next().copied();
        match (oldest_inflight, queue.min_id()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    };

    let Some(mut target) = highest_done else {
        return;
    };
    if let Some(bound) = bound {
        if bound <= target {
            target = bound.saturating_sub(1);
        }
    }
    if target == 0 {
        return;
    }

    let result = tokio::task::spawn_blocking(move || engine.advance_checkpoint(target)).await;
    match result {
        Ok(Ok(checkpoint)) => debug!(checkpoint, "Expiry checkpoint advanced"),
        Ok(Err(e)) => error!(target, error = %e, "Failed to advance expiry checkpoint"),
        Err(e) => error!(target, error = %e, "Checkpoint task failed"),
    }
}
