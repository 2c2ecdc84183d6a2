//! Operator-facing read and override operations on the ledger.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use clinsync_core::{
    EntityType, LedgerEntry, LedgerEntryId, LedgerStatus, Operation, TargetSystem,
};

use crate::ledger::{LedgerError, LedgerStats, LedgerStore};
use crate::workers::Dispatcher;

pub const DEFAULT_FAILED_LIMIT: usize = 100;

/// What an operator sees for one ledger entry. The payload is left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusView {
    pub id: LedgerEntryId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub target_system: TargetSystem,
    pub status: LedgerStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub exhausted: bool,
    pub priority: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&LedgerEntry> for SyncStatusView {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            operation: entry.operation,
            target_system: entry.target_system,
            status: entry.status,
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            exhausted: entry.status == LedgerStatus::Failed && entry.is_exhausted(),
            priority: entry.priority,
            next_retry_at: entry.next_retry_at,
            error_message: entry.error_message.clone(),
            last_error_at: entry.last_error_at,
            created_at: entry.created_at,
            completed_at: entry.completed_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("ledger entry not found: {0}")]
    NotFound(LedgerEntryId),
    #[error("ledger entry {id} is {status}; only failed entries can be retried")]
    NotRetryable { id: LedgerEntryId, status: LedgerStatus },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Operations exposed to the HTTP layer, independent of the store type.
#[async_trait]
pub trait SyncOperations: Send + Sync {
    async fn get_status(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<SyncStatusView>, AdminError>;

    async fn retry_now(&self, id: LedgerEntryId) -> Result<SyncStatusView, AdminError>;

    async fn list_failed(
        &self,
        target: Option<TargetSystem>,
        limit: usize,
    ) -> Result<Vec<SyncStatusView>, AdminError>;

    async fn stats(&self) -> Result<LedgerStats, AdminError>;
}

#[derive(Debug, Clone)]
pub struct SyncAdmin<S> {
    store: S,
    dispatcher: Dispatcher,
}

impl<S: LedgerStore> SyncAdmin<S> {
    pub fn new(store: S, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub fn into_operations(self) -> Arc<dyn SyncOperations> {
        Arc::new(self)
    }
}

#[async_trait]
impl<S: LedgerStore> SyncOperations for SyncAdmin<S> {
    async fn get_status(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<SyncStatusView>, AdminError> {
        let entries = self.store.find_by_entity(entity_type, entity_id).await?;
        Ok(entries.iter().map(SyncStatusView::from).collect())
    }

    async fn retry_now(&self, id: LedgerEntryId) -> Result<SyncStatusView, AdminError> {
        let current = self.store.get(id).await?.ok_or(AdminError::NotFound(id))?;
        if current.status != LedgerStatus::Failed {
            return Err(AdminError::NotRetryable {
                id,
                status: current.status,
            });
        }

        let entry = match self.store.reset_to_pending(id, Utc::now()).await {
            Ok(entry) => entry,
            // Lost a race with a worker or a second operator.
            Err(LedgerError::Transition(_)) => {
                let status = self
                    .store
                    .get(id)
                    .await?
                    .map_or(current.status, |e| e.status);
                return Err(AdminError::NotRetryable { id, status });
            }
            Err(LedgerError::NotFound(_)) => return Err(AdminError::NotFound(id)),
            Err(err) => return Err(err.into()),
        };

        info!(
            entry_id = %entry.id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            target_system = %entry.target_system,
            "manual retry requested"
        );
        if let Err(err) = self.dispatcher.try_submit(id) {
            warn!(entry_id = %id, error = %err, "manual retry not dispatched; left for the sweeper");
        }
        Ok(SyncStatusView::from(&entry))
    }

    async fn list_failed(
        &self,
        target: Option<TargetSystem>,
        limit: usize,
    ) -> Result<Vec<SyncStatusView>, AdminError> {
        let entries = self.store.list_failed(target, limit).await?;
        Ok(entries.iter().map(SyncStatusView::from).collect())
    }

    async fn stats(&self) -> Result<LedgerStats, AdminError> {
        Ok(self.store.stats().await?)
    }
}
