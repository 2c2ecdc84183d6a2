//! `clinsync-core`: domain building blocks for external synchronization.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the ledger entry model and its state machine, the retry policy, and the
//! contract domain snapshots implement to be enqueued.

pub mod entity;
pub mod error;
pub mod id;
pub mod ledger;
pub mod retry;

pub use entity::{EncounterSnapshot, OrderSnapshot, PatientSnapshot, Syncable};
pub use error::{DomainError, DomainResult};
pub use id::LedgerEntryId;
pub use ledger::{
    EntityType, FailureDisposition, FailureKind, LedgerEntry, LedgerStatus, NewLedgerEntry, Operation,
    TargetSystem,
};
pub use retry::{FailurePolicy, RetryPolicy};
