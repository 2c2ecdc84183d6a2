//! Ledger entry model: one durable unit of cross-system delivery work.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──▶ processing ──▶ done (terminal)
//!    ▲                   │
//!    │ retry_now         ▼
//!    └────────────── failed ──(backoff elapsed, budget left)──▶ processing
//! ```
//!
//! Every transition is a pure method on [`LedgerEntry`] so in-memory and
//! durable stores apply exactly the same rules.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::LedgerEntryId;
use crate::retry::{FailurePolicy, RetryPolicy};

macro_rules! storage_enum {
    ($t:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $t {
            /// Stable storage / wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $text,)+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($t::$variant),)+
                    other => Err(DomainError::unknown($kind, other)),
                }
            }
        }
    };
}

/// Kind of domain object that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Patient,
    Encounter,
    Order,
}

storage_enum!(EntityType, "entity type", {
    Patient => "patient",
    Encounter => "encounter",
    Order => "order",
});

/// Write operation to replay on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

storage_enum!(Operation, "operation", {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

/// External system of record an entry is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSystem {
    /// Legacy clinical-records system, written through its own tables.
    LegacyEmr,
    /// Standards-based clinical resource server, written over HTTP.
    FhirServer,
}

storage_enum!(TargetSystem, "target system", {
    LegacyEmr => "legacy_emr",
    FhirServer => "fhir_server",
});

impl TargetSystem {
    pub const ALL: [TargetSystem; 2] = [TargetSystem::LegacyEmr, TargetSystem::FhirServer];
}

/// Ledger entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Enqueued, waiting for a worker
    Pending,
    /// Claimed by a worker, delivery in flight
    Processing,
    /// Delivered (terminal)
    Done,
    /// Last attempt failed; retry-eligible while budget remains
    Failed,
}

storage_enum!(LedgerStatus, "ledger status", {
    Pending => "pending",
    Processing => "processing",
    Done => "done",
    Failed => "failed",
});

impl LedgerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerStatus::Done)
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload construction failed; source data may still change.
    Build,
    /// Network failure, timeout, 5xx, write conflict.
    Transient,
    /// Retrying cannot help (missing native id, malformed success).
    Fatal,
    /// Worker died or hung while the entry was `processing`.
    Stale,
}

/// What a failure did to the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Failed, eligible again once `next_retry_at` has elapsed.
    RetryScheduled { next_retry_at: DateTime<Utc> },
    /// Failed permanently; budget consumed.
    Exhausted,
    /// Entry was already done; nothing changed.
    AlreadyDone,
}

/// Request to create a ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub target_system: TargetSystem,
    /// Snapshot of the source entity captured at enqueue time
    pub payload: JsonValue,
    /// Lower value = swept first
    pub priority: i32,
    /// Attempt budget; the retry policy default when `None`
    pub max_retries: Option<u32>,
}

impl NewLedgerEntry {
    pub const DEFAULT_PRIORITY: i32 = 5;

    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        target_system: TargetSystem,
        payload: JsonValue,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation,
            target_system,
            payload,
            priority: Self::DEFAULT_PRIORITY,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A durable unit of pending cross-system work (outbox entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub target_system: TargetSystem,
    /// Immutable once set.
    pub payload: JsonValue,
    pub status: LedgerStatus,
    /// Attempts started so far (incremented when an attempt begins).
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i32,
    /// Sweep ordering key: creation time, then the next eligible retry time.
    pub scheduled_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Create a pending entry.
    pub fn new(request: NewLedgerEntry, policy: &RetryPolicy, now: DateTime<Utc>) -> Self {
        Self {
            id: LedgerEntryId::new(),
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            operation: request.operation,
            target_system: request.target_system,
            payload: request.payload,
            status: LedgerStatus::Pending,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(policy.default_max_retries),
            priority: request.priority,
            scheduled_at: now,
            next_retry_at: None,
            error_message: None,
            last_error_at: None,
            created_at: now,
            processing_started_at: None,
            completed_at: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// `failed`, budget left, and the backoff window has elapsed.
    pub fn is_retry_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == LedgerStatus::Failed
            && !self.is_exhausted()
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Whether a worker may take ownership of the entry right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            LedgerStatus::Pending => true,
            LedgerStatus::Failed => self.is_retry_eligible(now),
            LedgerStatus::Processing | LedgerStatus::Done => false,
        }
    }

    /// Start a delivery attempt. The attempt counts against the budget even if
    /// the process dies before the outcome is recorded.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_claimable(now) {
            return Err(DomainError::illegal_transition(format!(
                "entry {} is {} and cannot be claimed",
                self.id, self.status
            )));
        }

        self.status = LedgerStatus::Processing;
        self.retry_count += 1;
        self.processing_started_at = Some(now);
        Ok(())
    }

    /// Record a successful delivery. Returns `false` when already done.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<bool, DomainError> {
        match self.status {
            LedgerStatus::Done => Ok(false),
            LedgerStatus::Processing => {
                self.status = LedgerStatus::Done;
                self.next_retry_at = None;
                self.error_message = None;
                self.last_error_at = None;
                self.completed_at = Some(now);
                Ok(true)
            }
            other => Err(DomainError::illegal_transition(format!(
                "entry {} is {other}, only processing entries can complete",
                self.id
            ))),
        }
    }

    /// Record a failed attempt and schedule the next one if budget remains.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        kind: FailureKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, DomainError> {
        match self.status {
            LedgerStatus::Done => return Ok(FailureDisposition::AlreadyDone),
            LedgerStatus::Processing => {}
            other => {
                return Err(DomainError::illegal_transition(format!(
                    "entry {} is {other}, only processing entries can fail",
                    self.id
                )));
            }
        }

        if kind == FailureKind::Fatal && policy.failure_policy == FailurePolicy::FailFast {
            self.retry_count = self.retry_count.max(self.max_retries);
        }

        self.status = LedgerStatus::Failed;
        self.error_message = Some(error.into());
        self.last_error_at = Some(now);

        if RetryPolicy::should_retry(self.retry_count, self.max_retries) {
            let next = match kind {
                // The attempt never really ran its course; retry on the next sweep.
                FailureKind::Stale => now,
                _ => now + to_chrono(policy.delay_for_attempt(self.retry_count)),
            };
            self.next_retry_at = Some(next);
            self.scheduled_at = next;
            Ok(FailureDisposition::RetryScheduled { next_retry_at: next })
        } else {
            self.next_retry_at = None;
            Ok(FailureDisposition::Exhausted)
        }
    }

    /// Operator override: put a failed entry back in the queue with a fresh budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != LedgerStatus::Failed {
            return Err(DomainError::illegal_transition(format!(
                "entry {} is {}, only failed entries can be retried",
                self.id, self.status
            )));
        }

        self.status = LedgerStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.scheduled_at = now;
        Ok(())
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    // Only reachable with an absurd `max_delay`; a year is effectively "never".
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(max_retries: u32) -> LedgerEntry {
        let request = NewLedgerEntry::new(
            EntityType::Patient,
            "P-2025-000123",
            Operation::Create,
            TargetSystem::LegacyEmr,
            json!({"patient_id": "P-2025-000123"}),
        )
        .with_max_retries(max_retries);
        LedgerEntry::new(request, &RetryPolicy::default(), Utc::now())
    }

    #[test]
    fn new_entry_is_pending_with_default_budget() {
        let request = NewLedgerEntry::new(
            EntityType::Order,
            "O-1",
            Operation::Update,
            TargetSystem::FhirServer,
            json!({}),
        );
        let e = LedgerEntry::new(request, &RetryPolicy::default(), Utc::now());

        assert_eq!(e.status, LedgerStatus::Pending);
        assert_eq!(e.retry_count, 0);
        assert_eq!(e.max_retries, 5);
        assert_eq!(e.priority, NewLedgerEntry::DEFAULT_PRIORITY);
        assert_eq!(e.scheduled_at, e.created_at);
    }

    #[test]
    fn attempt_counts_as_soon_as_it_begins() {
        let mut e = entry(5);
        e.begin_attempt(Utc::now()).unwrap();

        assert_eq!(e.status, LedgerStatus::Processing);
        assert_eq!(e.retry_count, 1);
        assert!(e.processing_started_at.is_some());
    }

    #[test]
    fn processing_entry_cannot_be_claimed_twice() {
        let mut e = entry(5);
        let now = Utc::now();
        e.begin_attempt(now).unwrap();

        assert!(!e.is_claimable(now));
        assert!(matches!(
            e.begin_attempt(now),
            Err(DomainError::IllegalTransition(_))
        ));
        assert_eq!(e.retry_count, 1);
    }

    #[test]
    fn completion_is_terminal_and_idempotent() {
        let mut e = entry(5);
        let now = Utc::now();
        e.begin_attempt(now).unwrap();
        e.fail("boom", FailureKind::Transient, &RetryPolicy::default(), now)
            .unwrap();
        let later = e.next_retry_at.unwrap();
        e.begin_attempt(later).unwrap();

        assert!(e.complete(later).unwrap());
        assert_eq!(e.status, LedgerStatus::Done);
        assert_eq!(e.next_retry_at, None);
        assert_eq!(e.error_message, None);

        let frozen = e.clone();
        assert!(!e.complete(later + Duration::minutes(5)).unwrap());
        assert_eq!(
            e.fail("late", FailureKind::Transient, &RetryPolicy::default(), later)
                .unwrap(),
            FailureDisposition::AlreadyDone
        );
        assert_eq!(e, frozen);
    }

    #[test]
    fn failures_back_off_exponentially_until_exhausted() {
        let policy = RetryPolicy::default();
        let mut e = entry(4);
        let mut now = Utc::now();
        let mut gaps = Vec::new();

        loop {
            e.begin_attempt(now).unwrap();
            match e.fail("timeout", FailureKind::Transient, &policy, now).unwrap() {
                FailureDisposition::RetryScheduled { next_retry_at } => {
                    gaps.push((next_retry_at - now).num_minutes());
                    assert!(!e.is_retry_eligible(now));
                    now = next_retry_at;
                    assert!(e.is_retry_eligible(now));
                }
                FailureDisposition::Exhausted => break,
                FailureDisposition::AlreadyDone => unreachable!(),
            }
        }

        assert_eq!(gaps, vec![1, 2, 4]);
        assert_eq!(e.status, LedgerStatus::Failed);
        assert_eq!(e.retry_count, e.max_retries);
        assert_eq!(e.next_retry_at, None);
        assert!(!e.is_claimable(now + Duration::days(1)));
    }

    #[test]
    fn fatal_failure_exhausts_budget_under_fail_fast() {
        let mut e = entry(5);
        let now = Utc::now();
        e.begin_attempt(now).unwrap();

        let disposition = e
            .fail("no native id", FailureKind::Fatal, &RetryPolicy::default(), now)
            .unwrap();

        assert_eq!(disposition, FailureDisposition::Exhausted);
        assert_eq!(e.retry_count, 5);
        assert_eq!(e.next_retry_at, None);
    }

    #[test]
    fn fatal_failure_is_retried_under_uniform_policy() {
        let policy = RetryPolicy::default().with_failure_policy(FailurePolicy::Uniform);
        let mut e = entry(5);
        let now = Utc::now();
        e.begin_attempt(now).unwrap();

        let disposition = e
            .fail("malformed response", FailureKind::Fatal, &policy, now)
            .unwrap();

        assert!(matches!(disposition, FailureDisposition::RetryScheduled { .. }));
        assert_eq!(e.retry_count, 1);
    }

    #[test]
    fn stale_failure_is_eligible_immediately() {
        let mut e = entry(5);
        let now = Utc::now();
        e.begin_attempt(now).unwrap();

        let disposition = e
            .fail("processing timed out", FailureKind::Stale, &RetryPolicy::default(), now)
            .unwrap();

        assert_eq!(disposition, FailureDisposition::RetryScheduled { next_retry_at: now });
        assert!(e.is_retry_eligible(now));
    }

    #[test]
    fn reset_for_retry_restores_budget() {
        let mut e = entry(1);
        let now = Utc::now();
        e.begin_attempt(now).unwrap();
        e.fail("boom", FailureKind::Transient, &RetryPolicy::default(), now)
            .unwrap();
        assert!(e.is_exhausted());

        e.reset_for_retry(now).unwrap();

        assert_eq!(e.status, LedgerStatus::Pending);
        assert_eq!(e.retry_count, 0);
        assert_eq!(e.next_retry_at, None);
        assert_eq!(e.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn only_failed_entries_can_be_reset() {
        let mut e = entry(5);
        assert!(e.reset_for_retry(Utc::now()).is_err());
    }

    #[test]
    fn storage_strings_round_trip() {
        for status in [
            LedgerStatus::Pending,
            LedgerStatus::Processing,
            LedgerStatus::Done,
            LedgerStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<LedgerStatus>().unwrap(), status);
        }
        assert_eq!("fhir_server".parse::<TargetSystem>().unwrap(), TargetSystem::FhirServer);
        assert!(matches!(
            "carrier_pigeon".parse::<TargetSystem>(),
            Err(DomainError::UnknownVariant { kind: "target system", .. })
        ));
    }
}
