//! HTTP API: runtime wiring and the sync operations router.

pub mod app;
