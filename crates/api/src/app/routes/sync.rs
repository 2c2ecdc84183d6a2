use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use clinsync_core::{EntityType, LedgerEntryId, TargetSystem};
use clinsync_infra::admin::{SyncOperations, DEFAULT_FAILED_LIMIT};

use crate::app::{dto, errors};

const MAX_FAILED_LIMIT: usize = 1000;

pub fn router() -> Router {
    Router::new()
        .route("/status/:entity_type/:entity_id", get(get_status))
        .route("/failed", get(list_failed))
        .route("/entries/:id/retry", post(retry_now))
        .route("/stats", get(stats))
}

pub async fn get_status(
    Extension(ops): Extension<Arc<dyn SyncOperations>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> axum::response::Response {
    let parsed: EntityType = match errors::parse_param(&entity_type, "invalid_entity_type") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match ops.get_status(parsed, &entity_id).await {
        Ok(entries) if entries.is_empty() => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no sync entries for {entity_type} {entity_id}"),
        ),
        Ok(entries) => (
            StatusCode::OK,
            Json(dto::EntityStatusResponse {
                entity_type,
                entity_id,
                entries,
            }),
        )
            .into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn list_failed(
    Extension(ops): Extension<Arc<dyn SyncOperations>>,
    Query(query): Query<dto::FailedQuery>,
) -> axum::response::Response {
    let target = match query.target.as_deref() {
        None => None,
        Some(raw) => match errors::parse_param::<TargetSystem>(raw, "invalid_target") {
            Ok(t) => Some(t),
            Err(resp) => return resp,
        },
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FAILED_LIMIT)
        .clamp(1, MAX_FAILED_LIMIT);

    match ops.list_failed(target, limit).await {
        Ok(items) => (StatusCode::OK, Json(dto::ItemsResponse { items })).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn retry_now(
    Extension(ops): Extension<Arc<dyn SyncOperations>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: LedgerEntryId = match errors::parse_param(&id, "invalid_id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match ops.retry_now(id).await {
        Ok(view) => (StatusCode::ACCEPTED, Json(view)).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn stats(Extension(ops): Extension<Arc<dyn SyncOperations>>) -> axum::response::Response {
    match ops.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}
