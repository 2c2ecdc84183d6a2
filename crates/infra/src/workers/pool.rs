//! Dispatch queue and worker pool.
//!
//! Producers (the enqueuer after commit, the batch sweeper, operator retries)
//! hand ledger entry ids to a [`Dispatcher`]. Submission never blocks: when the
//! queue is full the id is dropped and the entry stays in the ledger for the
//! next sweep. The pool executes at most `concurrency` entries at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, info, warn};

use clinsync_core::LedgerEntryId;

use super::executor::{ProcessError, ProcessOutcome, SyncExecutor};
use super::WorkerHandle;
use crate::ledger::{ExternalLinks, LedgerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    Full,
    #[error("dispatch queue is closed")]
    Closed,
}

/// Sending side of the dispatch queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<LedgerEntryId>,
}

/// Receiving side of the dispatch queue, consumed by [`WorkerPool::spawn`].
#[derive(Debug)]
pub struct DispatchQueue {
    rx: mpsc::Receiver<LedgerEntryId>,
}

impl Dispatcher {
    pub fn channel(capacity: usize) -> (Dispatcher, DispatchQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Dispatcher { tx }, DispatchQueue { rx })
    }

    /// Fire-and-forget submission.
    pub fn try_submit(&self, id: LedgerEntryId) -> Result<(), DispatchError> {
        self.tx.try_send(id).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

impl DispatchQueue {
    pub async fn recv(&mut self) -> Option<LedgerEntryId> {
        self.rx.recv().await
    }

    /// Next queued id without waiting.
    pub fn try_recv(&mut self) -> Option<LedgerEntryId> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent deliveries
    pub concurrency: usize,
    /// Dispatch queue capacity
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 1024,
        }
    }
}

/// Runtime statistics of a worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub delivered: u64,
    pub retry_scheduled: u64,
    pub exhausted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    delivered: AtomicU64,
    retry_scheduled: AtomicU64,
    exhausted: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn record(&self, result: &Result<ProcessOutcome, ProcessError>) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(ProcessOutcome::Delivered { .. }) => &self.delivered,
            Ok(ProcessOutcome::RetryScheduled { .. }) => &self.retry_scheduled,
            Ok(ProcessOutcome::Exhausted | ProcessOutcome::FailedFatal) => &self.exhausted,
            Ok(ProcessOutcome::AlreadyDone | ProcessOutcome::NotClaimed(_)) => &self.skipped,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            processed: self.processed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retry_scheduled: self.retry_scheduled.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    worker: WorkerHandle,
    counters: Arc<Counters>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Stop taking new ids and wait for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}

/// Concurrency-limited consumer of the dispatch queue.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn<S>(
        executor: Arc<SyncExecutor<S>>,
        queue: DispatchQueue,
        config: &WorkerPoolConfig,
    ) -> WorkerPoolHandle
    where
        S: LedgerStore + ExternalLinks,
    {
        let shutdown = Arc::new(Notify::new());
        let counters = Arc::new(Counters::default());
        let concurrency = config.concurrency.clamp(1, max_concurrency());

        let join = tokio::spawn(run_pool(
            executor,
            queue,
            concurrency,
            shutdown.clone(),
            counters.clone(),
        ));

        info!(concurrency, "sync worker pool started");
        WorkerPoolHandle {
            worker: WorkerHandle::new("sync-worker-pool", shutdown, join),
            counters,
        }
    }
}

async fn run_pool<S>(
    executor: Arc<SyncExecutor<S>>,
    mut queue: DispatchQueue,
    concurrency: usize,
    shutdown: Arc<Notify>,
    counters: Arc<Counters>,
) where
    S: LedgerStore + ExternalLinks,
{
    let permits = Arc::new(Semaphore::new(concurrency));

    loop {
        let id = tokio::select! {
            _ = shutdown.notified() => break,
            next = queue.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        // Dropping `id` on shutdown is fine: the entry is still in the ledger.
        let permit = tokio::select! {
            _ = shutdown.notified() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let executor = executor.clone();
        let counters = counters.clone();
        counters.in_flight.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _permit = permit;
            let result = executor.process(id).await;
            if let Err(err) = &result {
                warn!(entry_id = %id, error = %err, "ledger entry processing failed");
            }
            counters.record(&result);
            counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    debug!("waiting for in-flight deliveries");
    match permits.acquire_many(drain_permits(concurrency)).await {
        Ok(_) => info!("sync worker pool stopped"),
        Err(_) => warn!("worker permits closed before in-flight deliveries drained"),
    }
}

/// Largest pool the semaphore can both hand out and drain in one call.
fn max_concurrency() -> usize {
    usize::try_from(u32::MAX)
        .unwrap_or(usize::MAX)
        .min(Semaphore::MAX_PERMITS)
}

fn drain_permits(concurrency: usize) -> u32 {
    u32::try_from(concurrency).unwrap_or(u32::MAX)
}
