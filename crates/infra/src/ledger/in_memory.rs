//! In-memory ledger store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use clinsync_core::{
    EntityType, FailureDisposition, FailureKind, LedgerEntry, LedgerEntryId, LedgerStatus,
    RetryPolicy, TargetSystem,
};

use super::store::{sort_for_sweep, ExternalLinks, LedgerError, LedgerStats, LedgerStore};

type LinkKey = (TargetSystem, EntityType, String);

/// Entries staged in an open transaction. Dropping it discards them.
#[derive(Debug, Default)]
pub struct InMemoryTx {
    staged: Vec<LedgerEntry>,
}

impl InMemoryTx {
    pub fn staged(&self) -> &[LedgerEntry] {
        &self.staged
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    entries: RwLock<HashMap<LedgerEntryId, LedgerEntry>>,
    links: RwLock<HashMap<LinkKey, String>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<LedgerEntryId, LedgerEntry>>, LedgerError> {
        self.entries
            .read()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<LedgerEntryId, LedgerEntry>>, LedgerError> {
        self.entries
            .write()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".into()))
    }

    /// Apply `f` to one entry under the write lock.
    fn update<T>(
        &self,
        id: LedgerEntryId,
        f: impl FnOnce(&mut LedgerEntry) -> Result<T, LedgerError>,
    ) -> Result<(LedgerEntry, T), LedgerError> {
        let mut entries = self.write()?;
        let entry = entries.get_mut(&id).ok_or(LedgerError::NotFound(id))?;

        // Work on a copy so a rejected transition leaves the stored entry untouched.
        let mut next = entry.clone();
        let out = f(&mut next)?;
        *entry = next.clone();
        Ok((next, out))
    }

    fn select(
        &self,
        filter: impl Fn(&LedgerEntry) -> bool,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.read()?;
        let mut result: Vec<_> = entries.values().filter(|e| filter(e)).cloned().collect();
        sort_for_sweep(&mut result);
        result.truncate(limit);
        Ok(result)
    }

    fn purge(&self, filter: impl Fn(&LedgerEntry) -> bool) -> Result<u64, LedgerError> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, e| !filter(e));
        Ok((before - entries.len()) as u64)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        Ok(InMemoryTx::default())
    }

    async fn insert(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<(), LedgerError> {
        if tx.staged.iter().any(|e| e.id == entry.id) || self.read()?.contains_key(&entry.id) {
            return Err(LedgerError::AlreadyExists(entry.id));
        }
        tx.staged.push(entry.clone());
        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        let mut entries = self.write()?;
        if let Some(dup) = tx.staged.iter().find(|e| entries.contains_key(&e.id)) {
            return Err(LedgerError::AlreadyExists(dup.id));
        }
        for entry in tx.staged {
            entries.insert(entry.id, entry);
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        drop(tx);
        Ok(())
    }

    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let mut entries = self.write()?;
        match entries.get_mut(&id) {
            Some(entry) if entry.is_claimable(now) => {
                entry.begin_attempt(now)?;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_done(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        let (entry, _) = self.update(id, |e| Ok(e.complete(now)?))?;
        Ok(entry)
    }

    async fn mark_failed(
        &self,
        id: LedgerEntryId,
        error: &str,
        kind: FailureKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(LedgerEntry, FailureDisposition), LedgerError> {
        self.update(id, |e| Ok(e.fail(error, kind, policy, now)?))
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.select(|e| e.status == LedgerStatus::Pending, limit)
    }

    async fn find_retry_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.select(|e| e.is_retry_eligible(now), limit)
    }

    async fn find_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.read()?;
        let mut result: Vec<_> = entries
            .values()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.created_at);
        Ok(result)
    }

    async fn list_failed(
        &self,
        target: Option<TargetSystem>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.read()?;
        let mut result: Vec<_> = entries
            .values()
            .filter(|e| {
                e.status == LedgerStatus::Failed && target.map_or(true, |t| e.target_system == t)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.last_error_at.cmp(&a.last_error_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn reset_to_pending(
        &self,
        id: LedgerEntryId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        let (entry, _) = self.update(id, |e| Ok(e.reset_for_retry(now)?))?;
        Ok(entry)
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries = self.write()?;
        let mut reclaimed = Vec::new();
        for entry in entries.values_mut() {
            let stale = entry.status == LedgerStatus::Processing
                && entry.processing_started_at.is_some_and(|at| at < cutoff);
            if stale {
                entry.fail("processing timed out", FailureKind::Stale, policy, now)?;
                reclaimed.push(entry.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn purge_done_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        self.purge(|e| {
            e.status == LedgerStatus::Done && e.completed_at.is_some_and(|at| at < cutoff)
        })
    }

    async fn purge_exhausted_before(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        self.purge(|e| {
            e.status == LedgerStatus::Failed
                && e.is_exhausted()
                && e.last_error_at.unwrap_or(e.created_at) < cutoff
        })
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let entries = self.read()?;
        let mut stats = LedgerStats::default();
        for entry in entries.values() {
            match entry.status {
                LedgerStatus::Pending => stats.pending += 1,
                LedgerStatus::Processing => stats.processing += 1,
                LedgerStatus::Done => stats.done += 1,
                LedgerStatus::Failed if entry.is_exhausted() => stats.failed_exhausted += 1,
                LedgerStatus::Failed => stats.failed_retryable += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl ExternalLinks for InMemoryLedgerStore {
    async fn external_id(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<String>, LedgerError> {
        let links = self
            .links
            .read()
            .map_err(|_| LedgerError::Storage("link lock poisoned".into()))?;
        Ok(links
            .get(&(target, entity_type, entity_id.to_string()))
            .cloned())
    }

    async fn link(
        &self,
        target: TargetSystem,
        entity_type: EntityType,
        entity_id: &str,
        external_id: &str,
    ) -> Result<(), LedgerError> {
        let mut links = self
            .links
            .write()
            .map_err(|_| LedgerError::Storage("link lock poisoned".into()))?;
        links.insert(
            (target, entity_type, entity_id.to_string()),
            external_id.to_string(),
        );
        Ok(())
    }
}
