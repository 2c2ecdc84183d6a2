//! Background delivery workers.
//!
//! - [`executor`]: processes one ledger entry end to end
//! - [`pool`]: bounded queue + concurrency-limited worker pool
//! - [`sweeper`]: periodic re-dispatch of pending / retry-eligible entries
//! - [`retention`]: periodic purge of old terminal entries

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub mod executor;
pub mod pool;
pub mod retention;
pub mod sweeper;

pub use executor::{ProcessError, ProcessOutcome, SyncExecutor};
pub use pool::{
    DispatchError, DispatchQueue, Dispatcher, PoolStats, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};
pub use retention::{RetentionConfig, RetentionReport, RetentionSweeper};
pub use sweeper::{BatchSweeper, SweepReport, SweeperConfig};

/// Handle to control and join a background task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: Arc<Notify>, join: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.join.await {
            tracing::warn!(worker = self.name, error = %err, "worker task did not stop cleanly");
        }
    }
}
