use serde::{Deserialize, Serialize};

use clinsync_infra::admin::SyncStatusView;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct FailedQuery {
    /// `legacy_emr` or `fhir_server`
    pub target: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct EntityStatusResponse {
    pub entity_type: String,
    pub entity_id: String,
    pub entries: Vec<SyncStatusView>,
}

#[derive(Debug, Serialize)]
pub struct ItemsResponse<T> {
    pub items: Vec<T>,
}
