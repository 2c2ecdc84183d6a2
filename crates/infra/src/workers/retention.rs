//! Periodic purge of terminal ledger entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::WorkerHandle;
use crate::ledger::{LedgerError, LedgerStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    pub interval: Duration,
    /// How long `done` entries are kept after completion
    pub done_retention: Duration,
    /// How long exhausted `failed` entries are kept after their last error
    pub failed_retention: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            done_retention: Duration::from_secs(7 * 24 * 60 * 60),
            failed_retention: Duration::from_secs(90 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub done_deleted: u64,
    pub failed_deleted: u64,
}

#[derive(Debug)]
pub struct RetentionSweeper<S> {
    store: S,
    config: RetentionConfig,
}

fn cutoff(now: DateTime<Utc>, keep: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(keep)
        .ok()
        .and_then(|keep| now.checked_sub_signed(keep))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<S: LedgerStore> RetentionSweeper<S> {
    pub fn new(store: S, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub async fn purge_once(&self, now: DateTime<Utc>) -> Result<RetentionReport, LedgerError> {
        let done_deleted = self
            .store
            .purge_done_before(cutoff(now, self.config.done_retention))
            .await?;
        let failed_deleted = self
            .store
            .purge_exhausted_before(cutoff(now, self.config.failed_retention))
            .await?;

        let report = RetentionReport {
            done_deleted,
            failed_deleted,
        };
        if done_deleted > 0 || failed_deleted > 0 {
            info!(done_deleted, failed_deleted, "purged old ledger entries");
        }
        Ok(report)
    }

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
                        if let Err(err) = self.purge_once(Utc::now()).await {
                            warn!(error = %err, "retention purge failed");
                        }
                    }
                }
            }
            info!("retention sweeper stopped");
        });
        WorkerHandle::new("retention-sweeper", shutdown, join)
    }
}
