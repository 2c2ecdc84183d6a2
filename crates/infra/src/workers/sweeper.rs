//! Batch sweeper: the safety net behind immediate dispatch.
//!
//! Every tick it first fails entries stuck in `processing` (the worker died
//! or hung), then re-submits pending and retry-eligible entries to the
//! dispatcher. It never processes entries itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use clinsync_core::RetryPolicy;

use super::pool::{DispatchError, Dispatcher};
use super::WorkerHandle;
use crate::ledger::{sort_for_sweep, LedgerError, LedgerStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub pending_limit: usize,
    pub retry_limit: usize,
    /// `processing` for longer than this is considered abandoned
    pub stale_after: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            pending_limit: 100,
            retry_limit: 50,
            stale_after: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub pending: usize,
    pub retries: usize,
    pub dispatched: usize,
    /// Left for the next tick because the queue was full
    pub deferred: usize,
}

#[derive(Debug)]
pub struct BatchSweeper<S> {
    store: S,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    config: SweeperConfig,
}

impl<S: LedgerStore> BatchSweeper<S> {
    pub fn new(store: S, dispatcher: Dispatcher, policy: RetryPolicy, config: SweeperConfig) -> Self {
        Self {
            store,
            dispatcher,
            policy,
            config,
        }
    }

    /// One sweep at `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, LedgerError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let reclaimed = self
            .store
            .reclaim_stale(now - stale_after, &self.policy, now)
            .await?;
        for entry in &reclaimed {
            warn!(
                entry_id = %entry.id,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                target_system = %entry.target_system,
                attempts = entry.retry_count,
                "reclaimed stale processing entry"
            );
        }

        let pending = self.store.find_pending(self.config.pending_limit).await?;
        let retries = self
            .store
            .find_retry_eligible(now, self.config.retry_limit)
            .await?;

        let mut report = SweepReport {
            reclaimed: reclaimed.len(),
            pending: pending.len(),
            retries: retries.len(),
            ..Default::default()
        };

        let mut batch = pending;
        batch.extend(retries);
        sort_for_sweep(&mut batch);

        for entry in &batch {
            match self.dispatcher.try_submit(entry.id) {
                Ok(()) => report.dispatched += 1,
                Err(DispatchError::Full) => {
                    report.deferred = batch.len() - report.dispatched;
                    debug!(deferred = report.deferred, "dispatch queue full; deferring rest of batch");
                    break;
                }
                Err(DispatchError::Closed) => {
                    report.deferred = batch.len() - report.dispatched;
                    warn!("dispatch queue closed; sweep aborted");
                    break;
                }
            }
        }

        if report.dispatched > 0 || report.reclaimed > 0 {
            info!(
                reclaimed = report.reclaimed,
                pending = report.pending,
                retries = report.retries,
                dispatched = report.dispatched,
                deferred = report.deferred,
                "sweep completed"
            );
        }
        Ok(report)
    }

    /// Run `sweep_once` on every tick until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once(Utc::now()).await {
                            warn!(error = %err, "sweep failed");
                        }
                    }
                }
            }
            info!("batch sweeper stopped");
        });
        WorkerHandle::new("batch-sweeper", shutdown, join)
    }
}
