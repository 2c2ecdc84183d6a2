//! Enqueue side of the outbox.
//!
//! The business write and its ledger entries share one store transaction. Ids
//! are handed to the dispatcher only after that transaction commits, so a
//! worker can never see an entry whose business write was rolled back.

use chrono::Utc;
use tracing::{debug, warn};

use clinsync_core::{
    DomainError, LedgerEntry, LedgerEntryId, NewLedgerEntry, Operation, RetryPolicy, Syncable,
};

use crate::ledger::{LedgerError, LedgerStore};
use crate::workers::{DispatchError, Dispatcher};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Entry point used by the business-write layer.
#[derive(Debug, Clone)]
pub struct Enqueuer<S> {
    store: S,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
}

impl<S: LedgerStore> Enqueuer<S> {
    pub fn new(store: S, dispatcher: Dispatcher, policy: RetryPolicy) -> Self {
        Self {
            store,
            dispatcher,
            policy,
        }
    }

    /// Open a unit of work around a fresh store transaction.
    pub async fn begin(&self) -> Result<UnitOfWork<'_, S>, EnqueueError> {
        let tx = self.store.begin().await?;
        Ok(UnitOfWork {
            enqueuer: self,
            tx,
            staged: Vec::new(),
        })
    }
}

/// A business transaction plus the ledger entries staged inside it.
///
/// Dropping it without [`UnitOfWork::commit`] discards the staged entries
/// together with the transaction.
pub struct UnitOfWork<'a, S: LedgerStore> {
    enqueuer: &'a Enqueuer<S>,
    tx: S::Tx,
    staged: Vec<LedgerEntryId>,
}

impl<S: LedgerStore> std::fmt::Debug for UnitOfWork<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("staged", &self.staged)
            .finish_non_exhaustive()
    }
}

impl<S: LedgerStore> UnitOfWork<'_, S> {
    /// The underlying transaction, for the business write itself.
    pub fn tx(&mut self) -> &mut S::Tx {
        &mut self.tx
    }

    pub fn staged(&self) -> &[LedgerEntryId] {
        &self.staged
    }

    /// Stage one ledger entry.
    pub async fn enqueue(&mut self, request: NewLedgerEntry) -> Result<LedgerEntryId, EnqueueError> {
        if request.entity_id.trim().is_empty() {
            return Err(DomainError::validation("entity_id must not be empty").into());
        }

        let entry = LedgerEntry::new(request, &self.enqueuer.policy, Utc::now());
        self.enqueuer.store.insert(&mut self.tx, &entry).await?;
        debug!(
            entry_id = %entry.id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            operation = %entry.operation,
            target_system = %entry.target_system,
            "ledger entry staged"
        );
        self.staged.push(entry.id);
        Ok(entry.id)
    }

    /// Stage one entry per target of `entity`, all sharing one snapshot.
    pub async fn enqueue_entity<E: Syncable + ?Sized>(
        &mut self,
        entity: &E,
        operation: Operation,
    ) -> Result<Vec<LedgerEntryId>, EnqueueError> {
        let snapshot = entity.snapshot();
        let entity_id = entity.entity_id();
        let mut ids = Vec::new();
        for target in entity.targets() {
            let request = NewLedgerEntry::new(
                entity.entity_type(),
                entity_id.clone(),
                operation,
                target,
                snapshot.clone(),
            )
            .with_priority(entity.priority());
            ids.push(self.enqueue(request).await?);
        }
        Ok(ids)
    }

    /// Commit, then hand every staged id to the dispatcher.
    ///
    /// A full or closed queue is not an error: the entries are durable and the
    /// batch sweeper will pick them up.
    pub async fn commit(self) -> Result<Vec<LedgerEntryId>, EnqueueError> {
        let Self {
            enqueuer,
            tx,
            staged,
        } = self;
        enqueuer.store.commit(tx).await?;

        for id in &staged {
            match enqueuer.dispatcher.try_submit(*id) {
                Ok(()) => {}
                Err(DispatchError::Full) => {
                    warn!(entry_id = %id, "dispatch queue full; entry left for the sweeper");
                }
                Err(DispatchError::Closed) => {
                    warn!(entry_id = %id, "dispatcher closed; entry left for the sweeper");
                }
            }
        }
        Ok(staged)
    }

    pub async fn rollback(self) -> Result<(), EnqueueError> {
        self.enqueuer.store.rollback(self.tx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use clinsync_core::{EntityType, LedgerStatus, OrderSnapshot, PatientSnapshot, TargetSystem};
    use serde_json::json;

    use crate::ledger::InMemoryLedgerStore;
    use crate::workers::DispatchQueue;

    type Store = Arc<InMemoryLedgerStore>;

    fn enqueuer(capacity: usize) -> (Store, Enqueuer<Store>, DispatchQueue) {
        let store = InMemoryLedgerStore::arc();
        let (dispatcher, queue) = Dispatcher::channel(capacity);
        let enqueuer = Enqueuer::new(store.clone(), dispatcher, RetryPolicy::default());
        (store, enqueuer, queue)
    }

    fn patient() -> PatientSnapshot {
        PatientSnapshot {
            patient_id: "P-1".into(),
            given_name: "Jiwoo".into(),
            family_name: "Park".into(),
            birth_date: NaiveDate::from_ymd_opt(1990, 4, 2),
            gender: Some("female".into()),
            phone: None,
            email: None,
            address: None,
            updated_at: Utc::now(),
        }
    }

    fn drain(queue: &mut DispatchQueue) -> Vec<LedgerEntryId> {
        std::iter::from_fn(|| queue.try_recv()).collect()
    }

    #[tokio::test]
    async fn entity_fans_out_to_every_target() {
        let (store, enqueuer, mut queue) = enqueuer(16);

        let mut uow = enqueuer.begin().await.unwrap();
        let ids = uow.enqueue_entity(&patient(), Operation::Create).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(queue.try_recv().is_none());
        uow.commit().await.unwrap();

        let entries = store.find_by_entity(EntityType::Patient, "P-1").await.unwrap();
        let mut targets: Vec<_> = entries.iter().map(|e| e.target_system).collect();
        targets.sort_by_key(|t| t.as_str());
        assert_eq!(targets, vec![TargetSystem::FhirServer, TargetSystem::LegacyEmr]);
        assert!(entries.iter().all(|e| e.status == LedgerStatus::Pending));
        assert!(entries.iter().all(|e| e.payload == entries[0].payload));
        assert_eq!(drain(&mut queue), ids);
    }

    #[tokio::test]
    async fn rollback_leaves_no_entries_and_dispatches_nothing() {
        let (store, enqueuer, mut queue) = enqueuer(16);

        let mut uow = enqueuer.begin().await.unwrap();
        uow.enqueue_entity(&patient(), Operation::Update).await.unwrap();
        uow.rollback().await.unwrap();

        assert!(store.is_empty());
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_unit_of_work_discards_entries() {
        let (store, enqueuer, _queue) = enqueuer(16);

        {
            let mut uow = enqueuer.begin().await.unwrap();
            uow.enqueue_entity(&patient(), Operation::Create).await.unwrap();
        }

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn order_priority_follows_urgency() {
        let (store, enqueuer, _queue) = enqueuer(16);
        let order = OrderSnapshot {
            order_id: "ORD-9".into(),
            patient_id: "P-1".into(),
            encounter_id: None,
            order_type: "laboratory".into(),
            code: "2345-7".into(),
            display: Some("Glucose".into()),
            urgency: "stat".into(),
            status: "active".into(),
            ordered_at: Utc::now(),
        };

        let mut uow = enqueuer.begin().await.unwrap();
        uow.enqueue_entity(&order, Operation::Create).await.unwrap();
        uow.commit().await.unwrap();

        let entries = store.find_by_entity(EntityType::Order, "ORD-9").await.unwrap();
        assert!(entries.iter().all(|e| e.priority == 1));
    }

    #[tokio::test]
    async fn blank_entity_id_is_rejected() {
        let (_store, enqueuer, _queue) = enqueuer(16);
        let mut uow = enqueuer.begin().await.unwrap();

        let err = uow
            .enqueue(NewLedgerEntry::new(
                EntityType::Patient,
                "  ",
                Operation::Create,
                TargetSystem::LegacyEmr,
                json!({}),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, EnqueueError::Validation(_)));
        assert!(uow.staged().is_empty());
    }

    #[tokio::test]
    async fn full_queue_does_not_fail_the_commit() {
        let (store, enqueuer, mut queue) = enqueuer(1);

        let mut uow = enqueuer.begin().await.unwrap();
        let ids = uow.enqueue_entity(&patient(), Operation::Create).await.unwrap();
        let committed = uow.commit().await.unwrap();

        assert_eq!(committed, ids);
        assert_eq!(store.len(), 2);
        assert_eq!(drain(&mut queue).len(), 1);
    }
}
