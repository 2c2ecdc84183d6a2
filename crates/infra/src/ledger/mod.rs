//! Durable ledger of outbox entries: the single source of truth for what must
//! still be delivered.
//!
//! The [`LedgerStore`] trait is storage-agnostic; [`InMemoryLedgerStore`]
//! backs tests and local development, [`PostgresLedgerStore`] production.

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::{InMemoryLedgerStore, InMemoryTx};
pub use postgres::PostgresLedgerStore;
pub use store::{sort_for_sweep, ExternalLinks, LedgerError, LedgerStats, LedgerStore};
