//! Legacy records system adapter.
//!
//! The legacy system is written through its own tables. Row access sits
//! behind [`LegacyRepository`]; the adapter only decides which call an
//! operation maps to and how to find the native id.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use clinsync_core::{Operation, TargetSystem};

use super::{DeliveryError, DeliveryReceipt, DeliveryRequest, TargetAdapter};

pub type Fields = Map<String, JsonValue>;

/// Row access to the legacy system's native tables.
#[async_trait]
pub trait LegacyRepository: Send + Sync {
    /// Insert a row under a freshly allocated native id.
    async fn create_record(
        &self,
        table: &str,
        external_key: &str,
        fields: &Fields,
    ) -> Result<i64, DeliveryError>;

    /// Overwrite the given columns. `false` when the row does not exist.
    async fn update_record(
        &self,
        table: &str,
        native_id: i64,
        fields: &Fields,
    ) -> Result<bool, DeliveryError>;

    /// Soft delete. `false` when the row does not exist.
    async fn deactivate_record(&self, table: &str, native_id: i64) -> Result<bool, DeliveryError>;

    async fn find_by_external_key(
        &self,
        table: &str,
        external_key: &str,
    ) -> Result<Option<i64>, DeliveryError>;
}

#[async_trait]
impl<R: LegacyRepository + ?Sized> LegacyRepository for Arc<R> {
    async fn create_record(
        &self,
        table: &str,
        external_key: &str,
        fields: &Fields,
    ) -> Result<i64, DeliveryError> {
        (**self).create_record(table, external_key, fields).await
    }

    async fn update_record(
        &self,
        table: &str,
        native_id: i64,
        fields: &Fields,
    ) -> Result<bool, DeliveryError> {
        (**self).update_record(table, native_id, fields).await
    }

    async fn deactivate_record(&self, table: &str, native_id: i64) -> Result<bool, DeliveryError> {
        (**self).deactivate_record(table, native_id).await
    }

    async fn find_by_external_key(
        &self,
        table: &str,
        external_key: &str,
    ) -> Result<Option<i64>, DeliveryError> {
        (**self).find_by_external_key(table, external_key).await
    }
}

#[derive(Debug)]
pub struct LegacyEmrAdapter<R> {
    repo: R,
}

impl<R: LegacyRepository> LegacyEmrAdapter<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Link recorded by an earlier delivery, else a lookup by local key.
    async fn native_id(&self, request: &DeliveryRequest) -> Result<i64, DeliveryError> {
        if let Some(id) = request
            .external_id
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok())
        {
            return Ok(id);
        }

        self.repo
            .find_by_external_key(request.payload.resource, &request.payload.external_key)
            .await?
            .ok_or_else(|| missing(request))
    }
}

fn missing(request: &DeliveryRequest) -> DeliveryError {
    DeliveryError::MissingExternalId {
        entity_type: request.entity_type,
        entity_id: request.entity_id.clone(),
    }
}

#[async_trait]
impl<R: LegacyRepository + 'static> TargetAdapter for LegacyEmrAdapter<R> {
    fn target(&self) -> TargetSystem {
        TargetSystem::LegacyEmr
    }

    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let table = request.payload.resource;
        let key = request.payload.external_key.as_str();
        let fields = request
            .payload
            .body
            .as_object()
            .ok_or_else(|| DeliveryError::InvalidPayload("legacy row must be a JSON object".into()))?;

        match request.operation {
            Operation::Create => {
                // A replayed create must not insert a second row.
                if let Some(native_id) = self.repo.find_by_external_key(table, key).await? {
                    debug!(
                        entry_id = %request.entry_id,
                        table,
                        native_id,
                        "legacy row already exists; updating instead"
                    );
                    self.repo.update_record(table, native_id, fields).await?;
                    return Ok(DeliveryReceipt::linked(native_id.to_string()));
                }
                let native_id = self.repo.create_record(table, key, fields).await?;
                Ok(DeliveryReceipt::linked(native_id.to_string()))
            }
            Operation::Update => {
                let native_id = self.native_id(request).await?;
                if !self.repo.update_record(table, native_id, fields).await? {
                    return Err(missing(request));
                }
                Ok(DeliveryReceipt::linked(native_id.to_string()))
            }
            Operation::Delete => {
                let native_id = self.native_id(request).await?;
                if !self.repo.deactivate_record(table, native_id).await? {
                    return Err(missing(request));
                }
                Ok(DeliveryReceipt::linked(native_id.to_string()))
            }
        }
    }
}

/// One row of an in-memory legacy table.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRecord {
    pub native_id: i64,
    pub external_key: String,
    pub fields: Fields,
}

/// In-memory legacy tables for tests/dev. Native ids come from one counter.
#[derive(Debug)]
pub struct InMemoryLegacyRepository {
    tables: Mutex<HashMap<String, BTreeMap<i64, LegacyRecord>>>,
    next_id: AtomicI64,
    failures: Mutex<VecDeque<DeliveryError>>,
}

impl Default for InMemoryLegacyRepository {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            failures: Mutex::new(VecDeque::new()),
        }
    }
}

impl InMemoryLegacyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next repository call fail with `err`.
    pub fn fail_next(&self, err: DeliveryError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(err);
        }
    }

    pub fn records(&self, table: &str) -> Vec<LegacyRecord> {
        self.tables
            .lock()
            .map(|t| t.get(table).map(|rows| rows.values().cloned().collect()))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, HashMap<String, BTreeMap<i64, LegacyRecord>>>, DeliveryError> {
        if let Some(err) = self.failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(err);
        }
        self.tables
            .lock()
            .map_err(|_| DeliveryError::Repository("legacy table lock poisoned".into()))
    }
}

#[async_trait]
impl LegacyRepository for InMemoryLegacyRepository {
    async fn create_record(
        &self,
        table: &str,
        external_key: &str,
        fields: &Fields,
    ) -> Result<i64, DeliveryError> {
        let mut tables = self.tables()?;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.values().any(|r| r.external_key == external_key) {
            return Err(DeliveryError::Conflict(format!(
                "{table} already has a row for {external_key}"
            )));
        }

        let native_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        rows.insert(
            native_id,
            LegacyRecord {
                native_id,
                external_key: external_key.to_string(),
                fields: fields.clone(),
            },
        );
        Ok(native_id)
    }

    async fn update_record(
        &self,
        table: &str,
        native_id: i64,
        fields: &Fields,
    ) -> Result<bool, DeliveryError> {
        let mut tables = self.tables()?;
        match tables.get_mut(table).and_then(|rows| rows.get_mut(&native_id)) {
            Some(record) => {
                for (column, value) in fields {
                    record.fields.insert(column.clone(), value.clone());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deactivate_record(&self, table: &str, native_id: i64) -> Result<bool, DeliveryError> {
        let mut tables = self.tables()?;
        match tables.get_mut(table).and_then(|rows| rows.get_mut(&native_id)) {
            Some(record) => {
                record
                    .fields
                    .insert("status".into(), JsonValue::String("inactive".into()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_external_key(
        &self,
        table: &str,
        external_key: &str,
    ) -> Result<Option<i64>, DeliveryError> {
        let tables = self.tables()?;
        Ok(tables.get(table).and_then(|rows| {
            rows.values()
                .find(|r| r.external_key == external_key)
                .map(|r| r.native_id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinsync_core::{EntityType, LedgerEntryId};
    use serde_json::json;

    use crate::payload::DeliveryPayload;

    fn request(operation: Operation, external_id: Option<&str>) -> DeliveryRequest {
        DeliveryRequest {
            entry_id: LedgerEntryId::new(),
            entity_type: EntityType::Patient,
            entity_id: "P-1".into(),
            operation,
            external_id: external_id.map(str::to_string),
            payload: DeliveryPayload {
                resource: "patient_data",
                external_key: "P-1".into(),
                body: json!({ "pubpid": "P-1", "fname": "Minji", "status": "active" }),
            },
        }
    }

    fn adapter() -> (Arc<InMemoryLegacyRepository>, LegacyEmrAdapter<Arc<InMemoryLegacyRepository>>) {
        let repo = Arc::new(InMemoryLegacyRepository::new());
        (repo.clone(), LegacyEmrAdapter::new(repo))
    }

    #[tokio::test]
    async fn create_allocates_a_native_id() {
        let (repo, adapter) = adapter();

        let receipt = adapter.deliver(&request(Operation::Create, None)).await.unwrap();

        assert_eq!(receipt, DeliveryReceipt::linked("1"));
        let rows = repo.records("patient_data");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["fname"], "Minji");
    }

    #[tokio::test]
    async fn replayed_create_does_not_duplicate_the_row() {
        let (repo, adapter) = adapter();

        let first = adapter.deliver(&request(Operation::Create, None)).await.unwrap();
        let second = adapter.deliver(&request(Operation::Create, None)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.records("patient_data").len(), 1);
    }

    #[tokio::test]
    async fn update_without_native_id_is_fatal() {
        let (_, adapter) = adapter();

        let err = adapter
            .deliver(&request(Operation::Update, None))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::MissingExternalId { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn update_uses_the_recorded_link() {
        let (repo, adapter) = adapter();
        adapter.deliver(&request(Operation::Create, None)).await.unwrap();

        let mut update = request(Operation::Update, Some("1"));
        update.payload.body = json!({ "fname": "Min-ji" });
        adapter.deliver(&update).await.unwrap();

        assert_eq!(repo.records("patient_data")[0].fields["fname"], "Min-ji");
    }

    #[tokio::test]
    async fn update_against_vanished_row_is_fatal() {
        let (_, adapter) = adapter();

        let err = adapter
            .deliver(&request(Operation::Update, Some("77")))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::MissingExternalId { .. }));
    }

    #[tokio::test]
    async fn delete_deactivates_the_row() {
        let (repo, adapter) = adapter();
        adapter.deliver(&request(Operation::Create, None)).await.unwrap();

        adapter.deliver(&request(Operation::Delete, None)).await.unwrap();

        assert_eq!(repo.records("patient_data")[0].fields["status"], "inactive");
    }

    #[tokio::test]
    async fn repository_failures_are_transient() {
        let (repo, adapter) = adapter();
        repo.fail_next(DeliveryError::Conflict("duplicate pid".into()));

        let err = adapter
            .deliver(&request(Operation::Create, None))
            .await
            .unwrap_err();

        assert!(!err.is_fatal());
        assert!(adapter.deliver(&request(Operation::Create, None)).await.is_ok());
    }
}
