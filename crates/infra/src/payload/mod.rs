//! Payload builders: turn the snapshot stored in a ledger entry into the
//! shape a target system accepts.
//!
//! Builders are pure. A failure here is never fatal for the entry; the source
//! snapshot is immutable, but a code fix plus an operator retry can still make
//! it deliverable.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use clinsync_core::{EntityType, LedgerEntry, TargetSystem};

pub mod fhir;
pub mod legacy;

pub use fhir::{FhirEncounterBuilder, FhirPatientBuilder, FhirServiceRequestBuilder};
pub use legacy::{LegacyEncounterBuilder, LegacyOrderBuilder, LegacyPatientBuilder};

/// Identifier system stamped on FHIR resources when none is configured.
pub const DEFAULT_IDENTIFIER_SYSTEM: &str = "urn:clinsync:local-id";

/// Target-shaped representation of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryPayload {
    /// Legacy table name or FHIR resource type
    pub resource: &'static str,
    /// Local identifier carried into the target (legacy external key, FHIR identifier)
    pub external_key: String,
    pub body: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("no payload builder registered for {entity_type} -> {target}")]
    NoBuilder {
        entity_type: EntityType,
        target: TargetSystem,
    },
    #[error("snapshot is missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub trait PayloadBuilder: Send + Sync {
    fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError>;
}

/// Builders keyed by `(entity type, target)`.
#[derive(Clone, Default)]
pub struct PayloadBuilders {
    builders: HashMap<(EntityType, TargetSystem), Arc<dyn PayloadBuilder>>,
}

impl std::fmt::Debug for PayloadBuilders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadBuilders")
            .field("registered", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PayloadBuilders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in builder for both targets.
    pub fn with_defaults(identifier_system: impl Into<String>) -> Self {
        let system = identifier_system.into();
        Self::new()
            .with(EntityType::Patient, TargetSystem::LegacyEmr, LegacyPatientBuilder)
            .with(EntityType::Encounter, TargetSystem::LegacyEmr, LegacyEncounterBuilder)
            .with(EntityType::Order, TargetSystem::LegacyEmr, LegacyOrderBuilder)
            .with(
                EntityType::Patient,
                TargetSystem::FhirServer,
                FhirPatientBuilder::new(system.clone()),
            )
            .with(
                EntityType::Encounter,
                TargetSystem::FhirServer,
                FhirEncounterBuilder::new(system.clone()),
            )
            .with(
                EntityType::Order,
                TargetSystem::FhirServer,
                FhirServiceRequestBuilder::new(system),
            )
    }

    pub fn with(
        mut self,
        entity_type: EntityType,
        target: TargetSystem,
        builder: impl PayloadBuilder + 'static,
    ) -> Self {
        self.register(entity_type, target, Arc::new(builder));
        self
    }

    pub fn register(
        &mut self,
        entity_type: EntityType,
        target: TargetSystem,
        builder: Arc<dyn PayloadBuilder>,
    ) {
        self.builders.insert((entity_type, target), builder);
    }

    pub fn build(&self, entry: &LedgerEntry) -> Result<DeliveryPayload, BuildError> {
        let builder = self
            .builders
            .get(&(entry.entity_type, entry.target_system))
            .ok_or(BuildError::NoBuilder {
                entity_type: entry.entity_type,
                target: entry.target_system,
            })?;
        builder.build(entry)
    }
}

/// Read-only view over a snapshot object.
pub(crate) struct Snapshot<'a> {
    fields: &'a Map<String, JsonValue>,
}

impl<'a> Snapshot<'a> {
    pub(crate) fn of(entry: &'a LedgerEntry) -> Result<Self, BuildError> {
        entry
            .payload
            .as_object()
            .map(|fields| Self { fields })
            .ok_or_else(|| BuildError::InvalidField {
                field: "payload",
                reason: "snapshot is not a JSON object".into(),
            })
    }

    /// A non-empty string field.
    pub(crate) fn required(&self, field: &'static str) -> Result<&'a str, BuildError> {
        self.optional(field).ok_or(BuildError::MissingField { field })
    }

    /// A string field; `None` when absent, null, or blank.
    pub(crate) fn optional(&self, field: &str) -> Option<&'a str> {
        self.fields
            .get(field)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// `YYYY-MM-DD` part of an RFC 3339 timestamp.
pub(crate) fn date_part(timestamp: &str) -> &str {
    timestamp.get(..10).unwrap_or(timestamp)
}
