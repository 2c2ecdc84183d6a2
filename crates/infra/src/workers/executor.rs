//! Ledger entry executor.
//!
//! Processing one entry:
//! 1. Skip it if it is already done.
//! 2. Claim it (single owner; the attempt is counted here).
//! 3. Build the payload, look up the remote id, deliver under a timeout.
//! 4. Record the external id and mark done, or record the failure.
//!
//! Running `process` twice for the same id is safe; the second call either
//! finds the entry done or loses the claim.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use clinsync_core::{
    FailureDisposition, FailureKind, LedgerEntry, LedgerEntryId, LedgerStatus, RetryPolicy,
};

use crate::adapters::{Adapters, DeliveryReceipt, DeliveryRequest};
use crate::ledger::{ExternalLinks, LedgerError, LedgerStore};
use crate::payload::PayloadBuilders;

/// What happened to an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Delivered { external_id: Option<String> },
    /// Already delivered before this call; nothing was sent.
    AlreadyDone,
    /// Owned by another worker or not eligible yet.
    NotClaimed(LedgerStatus),
    RetryScheduled { next_retry_at: DateTime<Utc> },
    /// Budget consumed by transient failures.
    Exhausted,
    /// The target can never accept this write.
    FailedFatal,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("ledger entry not found: {0}")]
    NotFound(LedgerEntryId),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A failed attempt, before it is written to the ledger.
#[derive(Debug)]
struct AttemptFailure {
    kind: FailureKind,
    message: String,
}

impl AttemptFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct SyncExecutor<S> {
    store: S,
    builders: PayloadBuilders,
    adapters: Adapters,
    policy: RetryPolicy,
    delivery_timeout: Duration,
}

impl<S> SyncExecutor<S>
where
    S: LedgerStore + ExternalLinks,
{
    pub fn new(
        store: S,
        builders: PayloadBuilders,
        adapters: Adapters,
        policy: RetryPolicy,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            store,
            builders,
            adapters,
            policy,
            delivery_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn process(&self, id: LedgerEntryId) -> Result<ProcessOutcome, ProcessError> {
        let current = self.store.get(id).await?.ok_or(ProcessError::NotFound(id))?;
        if current.status == LedgerStatus::Done {
            debug!(entry_id = %id, "entry already done");
            return Ok(ProcessOutcome::AlreadyDone);
        }

        let Some(entry) = self.store.claim(id, Utc::now()).await? else {
            debug!(entry_id = %id, status = %current.status, "entry not claimable");
            return Ok(ProcessOutcome::NotClaimed(current.status));
        };

        debug!(
            entry_id = %id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            target_system = %entry.target_system,
            attempt = entry.retry_count,
            "delivering ledger entry"
        );

        match self.attempt(&entry).await {
            Ok(receipt) => self.succeed(&entry, receipt).await,
            Err(failure) => self.record_failure(&entry, failure).await,
        }
    }

    async fn attempt(&self, entry: &LedgerEntry) -> Result<DeliveryReceipt, AttemptFailure> {
        let payload = self
            .builders
            .build(entry)
            .map_err(|e| AttemptFailure::new(FailureKind::Build, e.to_string()))?;

        let adapter = self.adapters.get(entry.target_system).ok_or_else(|| {
            AttemptFailure::new(
                FailureKind::Transient,
                format!("no adapter configured for {}", entry.target_system),
            )
        })?;

        let external_id = self
            .store
            .external_id(entry.target_system, entry.entity_type, &entry.entity_id)
            .await
            .map_err(|e| AttemptFailure::new(FailureKind::Transient, e.to_string()))?;

        let request = DeliveryRequest {
            entry_id: entry.id,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            operation: entry.operation,
            external_id,
            payload,
        };

        match tokio::time::timeout(self.delivery_timeout, adapter.deliver(&request)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(err)) => {
                let kind = if err.is_fatal() {
                    FailureKind::Fatal
                } else {
                    FailureKind::Transient
                };
                Err(AttemptFailure::new(kind, err.to_string()))
            }
            Err(_) => Err(AttemptFailure::new(
                FailureKind::Transient,
                format!("delivery timed out after {:?}", self.delivery_timeout),
            )),
        }
    }

    async fn succeed(
        &self,
        entry: &LedgerEntry,
        receipt: DeliveryReceipt,
    ) -> Result<ProcessOutcome, ProcessError> {
        if let Some(external_id) = &receipt.external_id {
            if let Err(err) = self
                .store
                .link(entry.target_system, entry.entity_type, &entry.entity_id, external_id)
                .await
            {
                // Later updates would not find the remote record; redeliver.
                let failure = AttemptFailure::new(
                    FailureKind::Transient,
                    format!("delivered but could not record external id: {err}"),
                );
                return self.record_failure(entry, failure).await;
            }
        }

        self.store.mark_done(entry.id, Utc::now()).await?;
        info!(
            entry_id = %entry.id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            target_system = %entry.target_system,
            external_id = receipt.external_id.as_deref().unwrap_or("-"),
            "ledger entry delivered"
        );
        Ok(ProcessOutcome::Delivered {
            external_id: receipt.external_id,
        })
    }

    async fn record_failure(
        &self,
        entry: &LedgerEntry,
        failure: AttemptFailure,
    ) -> Result<ProcessOutcome, ProcessError> {
        let (updated, disposition) = self
            .store
            .mark_failed(entry.id, &failure.message, failure.kind, &self.policy, Utc::now())
            .await?;

        let outcome = match disposition {
            FailureDisposition::AlreadyDone => ProcessOutcome::AlreadyDone,
            FailureDisposition::RetryScheduled { next_retry_at } => {
                warn!(
                    entry_id = %entry.id,
                    entity_type = %entry.entity_type,
                    entity_id = %entry.entity_id,
                    target_system = %entry.target_system,
                    attempt = updated.retry_count,
                    max_retries = updated.max_retries,
                    next_retry_at = %next_retry_at,
                    error = %failure.message,
                    "delivery failed; retry scheduled"
                );
                ProcessOutcome::RetryScheduled { next_retry_at }
            }
            FailureDisposition::Exhausted => {
                error!(
                    entry_id = %entry.id,
                    entity_type = %entry.entity_type,
                    entity_id = %entry.entity_id,
                    target_system = %entry.target_system,
                    attempts = updated.retry_count,
                    error = %failure.message,
                    "delivery failed permanently; operator action required"
                );
                if failure.kind == FailureKind::Fatal {
                    ProcessOutcome::FailedFatal
                } else {
                    ProcessOutcome::Exhausted
                }
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use clinsync_core::{
        EntityType, FailurePolicy, NewLedgerEntry, Operation, PatientSnapshot, Syncable,
        TargetSystem,
    };

    use crate::adapters::{DeliveryError, TargetAdapter};
    use crate::ledger::InMemoryLedgerStore;
    use crate::payload::{PayloadBuilders, DEFAULT_IDENTIFIER_SYSTEM};

    /// Adapter that replays a script of results, then succeeds.
    struct ScriptedAdapter {
        target: TargetSystem,
        script: Mutex<Vec<Result<DeliveryReceipt, DeliveryError>>>,
        calls: AtomicUsize,
        seen_external_ids: Mutex<Vec<Option<String>>>,
        delay: Duration,
    }

    impl ScriptedAdapter {
        fn new(target: TargetSystem, script: Vec<Result<DeliveryReceipt, DeliveryError>>) -> Self {
            Self {
                target,
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                seen_external_ids: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TargetAdapter for ScriptedAdapter {
        fn target(&self) -> TargetSystem {
            self.target
        }

        async fn deliver(
            &self,
            request: &DeliveryRequest,
        ) -> Result<DeliveryReceipt, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_external_ids
                .lock()
                .unwrap()
                .push(request.external_id.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(DeliveryReceipt::linked("ext-1"))
            } else {
                script.remove(0)
            }
        }
    }

    struct SharedAdapter(Arc<ScriptedAdapter>);

    #[async_trait]
    impl TargetAdapter for SharedAdapter {
        fn target(&self) -> TargetSystem {
            self.0.target()
        }

        async fn deliver(
            &self,
            request: &DeliveryRequest,
        ) -> Result<DeliveryReceipt, DeliveryError> {
            self.0.deliver(request).await
        }
    }

    fn patient() -> PatientSnapshot {
        PatientSnapshot {
            patient_id: "P-2025-000123".into(),
            given_name: "Minji".into(),
            family_name: "Park".into(),
            birth_date: None,
            gender: Some("female".into()),
            phone: None,
            email: None,
            address: None,
            updated_at: Utc::now(),
        }
    }

    struct Harness {
        store: Arc<InMemoryLedgerStore>,
        adapter: Arc<ScriptedAdapter>,
        executor: SyncExecutor<Arc<InMemoryLedgerStore>>,
    }

    fn harness(adapter: ScriptedAdapter, policy: RetryPolicy) -> Harness {
        let store = InMemoryLedgerStore::arc();
        let adapter = Arc::new(adapter);
        let executor = SyncExecutor::new(
            store.clone(),
            PayloadBuilders::with_defaults(DEFAULT_IDENTIFIER_SYSTEM),
            Adapters::new().with(SharedAdapter(adapter.clone())),
            policy,
            Duration::from_millis(200),
        );
        Harness {
            store,
            adapter,
            executor,
        }
    }

    async fn enqueue(store: &InMemoryLedgerStore, request: NewLedgerEntry) -> LedgerEntryId {
        let entry = LedgerEntry::new(request, &RetryPolicy::default(), Utc::now());
        let mut tx = store.begin().await.unwrap();
        store.insert(&mut tx, &entry).await.unwrap();
        store.commit(tx).await.unwrap();
        entry.id
    }

    fn patient_request(operation: Operation) -> NewLedgerEntry {
        let p = patient();
        NewLedgerEntry::new(
            p.entity_type(),
            p.entity_id(),
            operation,
            TargetSystem::LegacyEmr,
            p.snapshot(),
        )
    }

    #[tokio::test]
    async fn successful_delivery_links_and_completes() {
        let h = harness(
            ScriptedAdapter::new(TargetSystem::LegacyEmr, vec![Ok(DeliveryReceipt::linked("42"))]),
            RetryPolicy::default(),
        );
        let id = enqueue(&h.store, patient_request(Operation::Create)).await;

        let outcome = h.executor.process(id).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Delivered {
                external_id: Some("42".into())
            }
        );
        let entry = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Done);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(
            h.store
                .external_id(TargetSystem::LegacyEmr, EntityType::Patient, "P-2025-000123")
                .await
                .unwrap()
                .as_deref(),
            Some("42")
        );
    }

    #[tokio::test]
    async fn processing_a_done_entry_delivers_nothing() {
        let h = harness(
            ScriptedAdapter::new(TargetSystem::LegacyEmr, vec![]),
            RetryPolicy::default(),
        );
        let id = enqueue(&h.store, patient_request(Operation::Create)).await;

        h.executor.process(id).await.unwrap();
        let before = h.store.get(id).await.unwrap();
        let again = h.executor.process(id).await.unwrap();

        assert_eq!(again, ProcessOutcome::AlreadyDone);
        assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn transient_failure_schedules_backoff() {
        let h = harness(
            ScriptedAdapter::new(
                TargetSystem::LegacyEmr,
                vec![Err(DeliveryError::Network("connection reset".into()))],
            ),
            RetryPolicy::default(),
        );
        let id = enqueue(&h.store, patient_request(Operation::Create)).await;

        let before = Utc::now();
        let outcome = h.executor.process(id).await.unwrap();

        let ProcessOutcome::RetryScheduled { next_retry_at } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        let wait = next_retry_at - before;
        assert!(wait >= chrono::Duration::seconds(59) && wait <= chrono::Duration::seconds(61));

        let entry = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.error_message.unwrap().contains("connection reset"));

        // Not eligible before the backoff elapses.
        assert!(matches!(
            h.executor.process(id).await.unwrap(),
            ProcessOutcome::NotClaimed(LedgerStatus::Failed)
        ));
        assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_failure_exhausts_immediately_under_fail_fast() {
        let h = harness(
            ScriptedAdapter::new(
                TargetSystem::LegacyEmr,
                vec![Err(DeliveryError::MissingExternalId {
                    entity_type: EntityType::Patient,
                    entity_id: "P-2025-000123".into(),
                })],
            ),
            RetryPolicy::default(),
        );
        let id = enqueue(&h.store, patient_request(Operation::Update)).await;

        assert_eq!(h.executor.process(id).await.unwrap(), ProcessOutcome::FailedFatal);
        let entry = h.store.get(id).await.unwrap().unwrap();
        assert!(entry.is_exhausted());
        assert_eq!(entry.next_retry_at, None);
    }

    #[tokio::test]
    async fn fatal_failure_is_retried_under_uniform_policy() {
        let h = harness(
            ScriptedAdapter::new(
                TargetSystem::LegacyEmr,
                vec![Err(DeliveryError::MalformedResponse("no id".into()))],
            ),
            RetryPolicy::default().with_failure_policy(FailurePolicy::Uniform),
        );
        let id = enqueue(&h.store, patient_request(Operation::Create)).await;

        assert!(matches!(
            h.executor.process(id).await.unwrap(),
            ProcessOutcome::RetryScheduled { .. }
        ));
    }

    #[tokio::test]
    async fn build_failure_is_retryable() {
        let h = harness(
            ScriptedAdapter::new(TargetSystem::LegacyEmr, vec![]),
            RetryPolicy::default(),
        );
        let request = NewLedgerEntry::new(
            EntityType::Patient,
            "P-broken",
            Operation::Create,
            TargetSystem::LegacyEmr,
            serde_json::json!({ "patient_id": "P-broken" }),
        );
        let id = enqueue(&h.store, request).await;

        let outcome = h.executor.process(id).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::RetryScheduled { .. }));
        assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 0);
        let entry = h.store.get(id).await.unwrap().unwrap();
        assert!(entry.error_message.unwrap().contains("given_name"));
    }

    #[tokio::test]
    async fn slow_delivery_times_out_as_transient() {
        let mut adapter = ScriptedAdapter::new(TargetSystem::LegacyEmr, vec![]);
        adapter.delay = Duration::from_secs(5);
        let h = harness(adapter, RetryPolicy::default());
        let id = enqueue(&h.store, patient_request(Operation::Create)).await;

        let outcome = h.executor.process(id).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::RetryScheduled { .. }));
        let entry = h.store.get(id).await.unwrap().unwrap();
        assert!(entry.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_adapter_is_transient() {
        let h = harness(
            ScriptedAdapter::new(TargetSystem::LegacyEmr, vec![]),
            RetryPolicy::default(),
        );
        let p = patient();
        let request = NewLedgerEntry::new(
            p.entity_type(),
            p.entity_id(),
            Operation::Create,
            TargetSystem::FhirServer,
            p.snapshot(),
        );
        let id = enqueue(&h.store, request).await;

        assert!(matches!(
            h.executor.process(id).await.unwrap(),
            ProcessOutcome::RetryScheduled { .. }
        ));
    }

    #[tokio::test]
    async fn previous_link_is_passed_to_the_adapter() {
        let h = harness(
            ScriptedAdapter::new(TargetSystem::LegacyEmr, vec![]),
            RetryPolicy::default(),
        );
        h.store
            .link(TargetSystem::LegacyEmr, EntityType::Patient, "P-2025-000123", "7")
            .await
            .unwrap();
        let id = enqueue(&h.store, patient_request(Operation::Update)).await;

        h.executor.process(id).await.unwrap();

        assert_eq!(
            h.adapter.seen_external_ids.lock().unwrap().as_slice(),
            &[Some("7".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_entry_is_an_error() {
        let h = harness(
            ScriptedAdapter::new(TargetSystem::LegacyEmr, vec![]),
            RetryPolicy::default(),
        );
        let missing = LedgerEntryId::new();

        assert!(matches!(
            h.executor.process(missing).await,
            Err(ProcessError::NotFound(id)) if id == missing
        ));
    }
}
