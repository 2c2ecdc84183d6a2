//! Ledger store abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use clinsync_core::{
    DomainError, EntityType, FailureDisposition, FailureKind, LedgerEntry, LedgerEntryId,
    RetryPolicy, TargetSystem,
};

/// Ledger store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger entry not found: {0}")]
    NotFound(LedgerEntryId),
    #[error("ledger entry already exists: {0}")]
    AlreadyExists(LedgerEntryId),
    #[error(transparent)]
    Transition(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Entry counts by status. Failed entries are split by whether budget remains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed_retryable: u64,
    pub failed_exhausted: u64,
}

/// Durable outbox storage.
///
/// Writes that accompany a business change go through [`LedgerStore::begin`] /
/// [`LedgerStore::insert`] / [`LedgerStore::commit`] so they share the caller's
/// transaction. Everything else is a single atomic statement.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Write transaction handle shared with the business write.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, LedgerError>;

    /// Stage an entry inside `tx`. Invisible to workers until commit.
    async fn insert(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<(), LedgerError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), LedgerError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), LedgerError>;

    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Compare-and-set `pending | eligible failed -> processing`, counting the
    /// attempt. `None` when another worker owns it or it is not eligible.
    async fn claim(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Mark delivered. A no-op on entries that are already done.
    async fn mark_done(&self, id: LedgerEntryId, now: DateTime<Utc>)
        -> Result<LedgerEntry, LedgerError>;

    /// Record a failed attempt and schedule the next one.
    async fn mark_failed(
        &self,
        id: LedgerEntryId,
        error: &str,
        kind: FailureKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(LedgerEntry, FailureDisposition), LedgerError>;

    /// Pending entries in sweep order.
    async fn find_pending(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Failed entries with budget left whose backoff has elapsed, in sweep order.
    async fn find_retry_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Every entry for one entity, oldest first.
    async fn find_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Failed entries, most recent failure first.
    async fn list_failed(
        &self,
        target: Option<TargetSystem>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Operator retry: `failed -> pending` with a fresh budget.
    async fn reset_to_pending(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError>;

    /// Fail every `processing` entry whose attempt started before `cutoff`.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Delete done entries completed before `cutoff`.
    async fn purge_done_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError>;

    /// Delete exhausted failures whose last error is older than `cutoff`.
    async fn purge_exhausted_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError>;

    async fn stats(&self) -> Result<LedgerStats, LedgerError>;
}

/// Mapping between local entity ids and the identifiers a target assigned.
#[async_trait]
pub trait ExternalLinks: Send + Sync + 'static {
    async fn external_id(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<String>, LedgerError>;

    /// Upsert the link. The latest delivery wins.
    async fn link(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
        external_id: &str,
    ) -> Result<(), LedgerError>;
}

/// Sweep order: lower priority value first, then earlier `scheduled_at`.
pub fn sort_for_sweep(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.scheduled_at.cmp(&b.scheduled_at))
    });
}

#[async_trait]
impl<S: LedgerStore> LedgerStore for Arc<S> {
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        (**self).begin().await
    }

    async fn insert(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<(), LedgerError> {
        (**self).insert(tx, entry).await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        (**self).commit(tx).await
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        (**self).rollback(tx).await
    }

    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        (**self).get(id).await
    }

    async fn claim(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        (**self).claim(id, now).await
    }

    async fn mark_done(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        (**self).mark_done(id, now).await
    }

    async fn mark_failed(
        &self,
        id: LedgerEntryId,
        error: &str,
        kind: FailureKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(LedgerEntry, FailureDisposition), LedgerError> {
        (**self).mark_failed(id, error, kind, policy, now).await
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).find_pending(limit).await
    }

    async fn find_retry_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).find_retry_eligible(now, limit).await
    }

    async fn find_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).find_by_entity(entity_type, entity_id).await
    }

    async fn list_failed(
        &self,
        target: Option<TargetSystem>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).list_failed(target, limit).await
    }

    async fn reset_to_pending(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        (**self).reset_to_pending(id, now).await
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).reclaim_stale(cutoff, policy, now).await
    }

    async fn purge_done_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        (**self).purge_done_before(cutoff).await
    }

    async fn purge_exhausted_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        (**self).purge_exhausted_before(cutoff).await
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        (**self).stats().await
    }
}

#[async_trait]
impl<S: ExternalLinks> ExternalLinks for Arc<S> {
    async fn external_id(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<String>, LedgerError> {
        (**self).external_id(target, entity_type, entity_id).await
    }

    async fn link(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
        external_id: &str,
    ) -> Result<(), LedgerError> {
        (**self)
            .link(target, entity_type, entity_id, external_id)
            .await
    }
}
