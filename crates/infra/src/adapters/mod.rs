//! Target adapters: deliver a built payload to one external system.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use clinsync_core::{EntityType, LedgerEntryId, Operation, TargetSystem};

use crate::payload::DeliveryPayload;

pub mod fhir;
pub mod legacy;
pub mod legacy_postgres;

pub use fhir::FhirServerAdapter;
pub use legacy::{InMemoryLegacyRepository, LegacyEmrAdapter, LegacyRecord, LegacyRepository};
pub use legacy_postgres::PostgresLegacyRepository;

/// Everything an adapter needs to replay one write.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub entry_id: LedgerEntryId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    /// Identifier the target assigned on an earlier delivery, if any
    pub external_id: Option<String>,
    pub payload: DeliveryPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Identifier assigned (or confirmed) by the target
    pub external_id: Option<String>,
}

impl DeliveryReceipt {
    pub fn linked(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
        }
    }

    pub fn unlinked() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    /// 5xx, 408, 429 and 401 (the token may be refreshed)
    #[error("target unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },
    /// Any other 4xx
    #[error("target rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("no native id known for {entity_type} {entity_id}")]
    MissingExternalId {
        entity_type: EntityType,
        entity_id: String,
    },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("repository error: {0}")]
    Repository(String),
}

impl DeliveryError {
    /// Retrying the same request cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeliveryError::Rejected { .. }
                | DeliveryError::MissingExternalId { .. }
                | DeliveryError::MalformedResponse(_)
                | DeliveryError::InvalidPayload(_)
        )
    }
}

#[async_trait]
pub trait TargetAdapter: Send + Sync {
    fn target(&self) -> TargetSystem;

    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Adapters keyed by target system.
#[derive(Clone, Default)]
pub struct Adapters {
    adapters: HashMap<TargetSystem, Arc<dyn TargetAdapter>>,
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters")
            .field("targets", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: impl TargetAdapter + 'static) -> Self {
        self.register(Arc::new(adapter));
        self
    }

    /// Register (or replace) the adapter for `adapter.target()`.
    pub fn register(&mut self, adapter: Arc<dyn TargetAdapter>) {
        self.adapters.insert(adapter.target(), adapter);
    }

    pub fn get(&self, target: TargetSystem) -> Option<&Arc<dyn TargetAdapter>> {
        self.adapters.get(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_separates_fatal_from_transient() {
        let transient = [
            DeliveryError::Network("connection reset".into()),
            DeliveryError::Timeout("30s".into()),
            DeliveryError::Unavailable {
                status: 503,
                body: String::new(),
            },
            DeliveryError::Conflict("duplicate pid".into()),
            DeliveryError::Repository("pool closed".into()),
        ];
        let fatal = [
            DeliveryError::Rejected {
                status: 422,
                body: "invalid resource".into(),
            },
            DeliveryError::MissingExternalId {
                entity_type: EntityType::Patient,
                entity_id: "P-1".into(),
            },
            DeliveryError::MalformedResponse("no id".into()),
            DeliveryError::InvalidPayload("not an object".into()),
        ];

        assert!(transient.iter().all(|e| !e.is_fatal()));
        assert!(fatal.iter().all(DeliveryError::is_fatal));
    }
}
